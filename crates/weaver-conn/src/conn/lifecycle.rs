//! lifecycle - envelope / weavelet 両側で共有する接続のライフサイクル
//!
//! # タスク構成
//! - **reader**: `Transport::recv` をループし、request と notification を
//!   queue に積む。reply は `recv` の中で waiter に振り分けられる
//! - **watcher**: lifetime token のキャンセルを待って接続を止める。
//!   `serve` が一度も呼ばれなくてもキャンセルが効く
//! - **dispatcher**: `serve` が起動する。queue から 1 件ずつ pop し、
//!   到着順に handler へ渡す
//!
//! どのタスクも [`Shared::stop`] で接続を終わらせられる。

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnError, TransportError};
use crate::protos::Message;
use crate::queue::Queue;
use crate::transport::Transport;

/// 全 background タスクから参照される接続状態
pub(crate) struct Shared<T: Transport> {
    /// 自分側の名前（ログ用）
    pub(crate) name: &'static str,
    /// 相手側の名前（エラー用）
    pub(crate) peer: &'static str,
    /// lifetime token。呼び出し側 token の child
    pub(crate) token: CancellationToken,
    pub(crate) transport: T,
    pub(crate) msgs: Queue<T::In>,
    /// 最初の terminal error。一度だけセットされる
    err: OnceLock<ConnError>,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn new(
        name: &'static str,
        peer: &'static str,
        token: CancellationToken,
        transport: T,
    ) -> Self {
        Self {
            name,
            peer,
            token,
            transport,
            msgs: Queue::new(),
            err: OnceLock::new(),
        }
    }

    /// `err` で接続を終了する
    ///
    /// 残るのは最初の呼び出しのエラーだけ。ただし token のキャンセルと
    /// transport の cleanup は毎回行い、ブロック中の操作を必ず解放する。
    pub(crate) fn stop(&self, err: ConnError) {
        if self.err.set(err.clone()).is_ok() {
            if err.is_cancelled() {
                tracing::debug!(conn = self.name, "connection cancelled");
            } else {
                tracing::warn!(conn = self.name, error = %err, "connection stopped");
            }
        }
        self.token.cancel();
        self.transport.cleanup(err);
    }

    pub(crate) fn error(&self) -> Option<&ConnError> {
        self.err.get()
    }

    /// 相手へ blocking call を発行する
    ///
    /// transport の失敗は接続を止め、[`ConnError::Broken`] として返る。
    /// reply の error 文字列が空でなければ [`ConnError::Application`] に
    /// なり、接続はそのまま残る。
    pub(crate) async fn rpc(&self, req: T::Out) -> Result<T::In, ConnError> {
        let reply = match self.transport.do_blocking_rpc(req).await {
            Ok(reply) => reply,
            Err(err) => return Err(self.broken(err)),
        };
        if !reply.error().is_empty() {
            return Err(ConnError::Application(reply.error().to_string()));
        }
        Ok(reply)
    }

    /// reply を期待しないメッセージを送る
    pub(crate) async fn notify(&self, msg: T::Out) -> Result<(), ConnError> {
        self.transport
            .send(msg)
            .await
            .map_err(|err| self.broken(err))
    }

    fn broken(&self, err: ConnError) -> ConnError {
        let err = ConnError::broken(self.peer, err);
        self.stop(err.clone());
        err
    }
}

/// RPC reply から `pick` が受け付ける payload を取り出す
///
/// payload が無ければ `MissingReply`、種類違いなら `UnexpectedReply`。
/// どちらも接続は止めない。
pub(crate) fn expect_reply<M: Message, R>(
    reply: M,
    expected: &'static str,
    pick: impl FnOnce(M::Payload) -> Option<R>,
) -> Result<R, ConnError> {
    let got = reply.kind();
    let Some(payload) = reply.into_payload() else {
        return Err(ConnError::MissingReply { expected });
    };
    pick(payload).ok_or(ConnError::UnexpectedReply { expected, got })
}

/// 相手の最初のフレームを待つ。`token` がキャンセルされたら諦める
pub(crate) async fn recv_first<T: Transport>(
    token: &CancellationToken,
    transport: &T,
) -> Result<T::In, ConnError> {
    tokio::select! {
        _ = token.cancelled() => Err(ConnError::Cancelled),
        res = transport.recv() => res,
    }
}

/// reader と watcher を起動する
pub(crate) fn start<T: Transport>(shared: &Arc<Shared<T>>) -> JoinSet<()> {
    let mut running = JoinSet::new();

    let s = Arc::clone(shared);
    running.spawn(async move {
        loop {
            match s.transport.recv().await {
                Ok(msg) => s.msgs.push(msg),
                Err(err) => {
                    s.stop(err);
                    return;
                }
            }
        }
    });

    let s = Arc::clone(shared);
    running.spawn(async move {
        s.token.cancelled().await;
        s.stop(ConnError::Cancelled);
    });

    running
}

/// 相手から届いた 1 メッセージを処理する
#[async_trait]
pub(crate) trait Dispatch<T: Transport>: Send + Sync + 'static {
    async fn dispatch(&self, shared: &Shared<T>, msg: T::In) -> Result<(), ConnError>;
}

/// dispatcher を起動し、全 background タスクの終了を待って latch された
/// terminal error を返す
///
/// タスクの join は別タスク（supervisor）で行う。`serve` の future が
/// timeout や `select!` で drop されても JoinSet は abort されず、接続は
/// 動き続ける。止めるのは token のキャンセルか接続の drop。
pub(crate) async fn serve<T, D>(
    shared: &Arc<Shared<T>>,
    running: &Mutex<Option<JoinSet<()>>>,
    dispatcher: D,
) -> ConnError
where
    T: Transport,
    D: Dispatch<T>,
{
    let Some(mut running) = running
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
    else {
        return ConnError::AlreadyServing;
    };

    // stop() が先に走っていれば最初の pop で抜ける
    let s = Arc::clone(shared);
    running.spawn(async move {
        loop {
            let msg = match s.msgs.pop(&s.token).await {
                Ok(msg) => msg,
                Err(err) => {
                    s.stop(err);
                    return;
                }
            };
            if let Err(err) = dispatcher.dispatch(&s, msg).await {
                s.stop(err);
                return;
            }
        }
    });

    let s = Arc::clone(shared);
    let supervisor = tokio::spawn(async move {
        while let Some(res) = running.join_next().await {
            if let Err(err) = res
                && err.is_panic()
            {
                s.stop(ConnError::TaskPanicked(err.to_string()));
            }
        }
    });
    // supervisor が JoinError になるのは runtime の shutdown 時だけ
    if supervisor.await.is_err() {
        shared.stop(ConnError::Cancelled);
    }

    shared
        .error()
        .cloned()
        .unwrap_or(ConnError::Transport(TransportError::Closed))
}
