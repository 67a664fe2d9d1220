//! StreamTransport - `AsyncRead` / `AsyncWrite` の組（pipe, socket など）上の [`Transport`]

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, oneshot};
use tokio_util::sync::CancellationToken;

use super::Transport;
use super::frame;
use crate::config::ConnOptions;
use crate::error::{ConnError, TransportError};
use crate::protos::Message;

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct State<In> {
    /// 最後に払い出した correlation id。1 から始まる
    last_id: i64,
    /// 応答待ちの blocking call
    waiters: HashMap<i64, oneshot::Sender<In>>,
    /// 最初の `cleanup` で一度だけセットされる
    failed: Option<ConnError>,
}

/// lock 中の stream slot
///
/// 解放時に transport が閉じていれば stream も閉じる。`cleanup` の
/// `try_lock` が使用中の slot に負けても、stream は最後の利用者が閉じる。
struct Slot<'a, S> {
    guard: AsyncMutexGuard<'a, Option<S>>,
    closed: &'a CancellationToken,
}

impl<'a, S> Slot<'a, S> {
    async fn lock(slot: &'a AsyncMutex<Option<S>>, closed: &'a CancellationToken) -> Self {
        Self {
            guard: slot.lock().await,
            closed,
        }
    }
}

impl<S> Deref for Slot<'_, S> {
    type Target = Option<S>;

    fn deref(&self) -> &Option<S> {
        &self.guard
    }
}

impl<S> DerefMut for Slot<'_, S> {
    fn deref_mut(&mut self) -> &mut Option<S> {
        &mut self.guard
    }
}

impl<S> Drop for Slot<'_, S> {
    fn drop(&mut self) {
        if self.closed.is_cancelled() {
            self.guard.take();
        }
    }
}

/// StreamTransport は byte stream の組の上でメッセージをやり取りする
///
/// # 実装詳細
/// - writer は lock の下で書くので、並行する send のフレームは混ざらない
/// - reader の lock は `cleanup` が閉じるためだけのもの。`recv` を呼ぶのは
///   1 タスクだけ
/// - `closed` token で読み書き中の操作を起こす
pub struct StreamTransport<Out, In> {
    /// ログ用の自分側の名前
    name: &'static str,
    max_frame_size: usize,
    reader: AsyncMutex<Option<BoxReader>>,
    writer: AsyncMutex<Option<BoxWriter>>,
    state: Mutex<State<In>>,
    /// `cleanup` でキャンセルされる
    closed: CancellationToken,
    _out: PhantomData<fn(Out)>,
}

impl<Out: Message, In: Message> StreamTransport<Out, In> {
    /// 新しい StreamTransport を作成。`name` はログで自分側を示す
    pub fn new<R, W>(name: &'static str, reader: R, writer: W, options: &ConnOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            name,
            max_frame_size: options.max_frame_size,
            reader: AsyncMutex::new(Some(Box::new(reader))),
            writer: AsyncMutex::new(Some(Box::new(writer))),
            state: Mutex::new(State {
                last_id: 0,
                waiters: HashMap::new(),
                failed: None,
            }),
            closed: CancellationToken::new(),
            _out: PhantomData,
        }
    }

    /// `cleanup` 済みなら true
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn state(&self) -> MutexGuard<'_, State<In>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `cleanup` 後にすべての操作が返すエラー
    fn failure(&self) -> ConnError {
        self.state()
            .failed
            .clone()
            .unwrap_or(ConnError::Transport(TransportError::Closed))
    }

    /// `err` で transport を閉じ、勝ったほうのエラーを返す
    fn fail(&self, err: ConnError) -> ConnError {
        self.cleanup(err);
        self.failure()
    }

    async fn read_body(&self) -> Result<Vec<u8>, ConnError> {
        let mut reader = Slot::lock(&self.reader, &self.closed).await;
        let res = {
            let Some(r) = reader.as_mut() else {
                return Err(self.failure());
            };
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                res = frame::read_frame(r, self.max_frame_size) => Some(res),
            }
        };
        match res {
            None => Err(self.failure()),
            Some(Ok(body)) => Ok(body),
            Some(Err(err)) => {
                drop(reader);
                Err(self.fail(err.into()))
            }
        }
    }
}

#[async_trait]
impl<Out: Message, In: Message> Transport for StreamTransport<Out, In> {
    type Out = Out;
    type In = In;

    async fn send(&self, msg: Out) -> Result<(), ConnError> {
        if let Some(err) = self.state().failed.clone() {
            return Err(err);
        }
        let body = serde_json::to_vec(&msg).map_err(|e| TransportError::Encode(e.to_string()))?;

        let mut writer = Slot::lock(&self.writer, &self.closed).await;
        let res = {
            let Some(w) = writer.as_mut() else {
                return Err(self.failure());
            };
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => None,
                res = frame::write_frame(w, &body, self.max_frame_size) => Some(res),
            }
        };
        match res {
            None => Err(self.failure()),
            Some(Ok(())) => {
                tracing::trace!(conn = self.name, id = msg.id(), kind = msg.kind(), "sent");
                Ok(())
            }
            // wire には何も出ていないので stream はまだ使える
            Some(Err(err @ TransportError::FrameTooLarge { .. })) => Err(err.into()),
            Some(Err(err)) => {
                drop(writer);
                Err(self.fail(err.into()))
            }
        }
    }

    async fn recv(&self) -> Result<In, ConnError> {
        loop {
            let body = self.read_body().await?;
            let msg: In = match serde_json::from_slice(&body) {
                Ok(msg) => msg,
                Err(err) => {
                    return Err(self.fail(TransportError::Decode(err.to_string()).into()));
                }
            };
            tracing::trace!(conn = self.name, id = msg.id(), kind = msg.kind(), "received");
            if !msg.is_reply() {
                return Ok(msg);
            }

            let id = -msg.id();
            let waiter = self.state().waiters.remove(&id);
            match waiter {
                // 呼び出し側が諦めていれば reply は捨てる
                Some(tx) => {
                    let _ = tx.send(msg);
                }
                None => {
                    let err = ConnError::Protocol(format!("reply for unknown call id={id}"));
                    return Err(self.fail(err));
                }
            }
        }
    }

    async fn do_blocking_rpc(&self, mut req: Out) -> Result<In, ConnError> {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.state();
            if let Some(err) = &state.failed {
                return Err(err.clone());
            }
            state.last_id += 1;
            let id = state.last_id;
            state.waiters.insert(id, tx);
            id
        };
        req.set_id(id);

        if let Err(err) = self.send(req).await {
            self.state().waiters.remove(&id);
            return Err(err);
        }
        // transport が先に死ねば sender は `cleanup` で drop される
        rx.await.map_err(|_| self.failure())
    }

    fn cleanup(&self, err: ConnError) {
        let waiters = {
            let mut state = self.state();
            if state.failed.is_some() {
                return;
            }
            tracing::debug!(conn = self.name, error = %err, "closing transport");
            state.failed = Some(err);
            std::mem::take(&mut state.waiters)
        };
        drop(waiters);
        self.closed.cancel();

        // 使用中の slot は `Slot` の drop で閉じられる
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
    }
}
