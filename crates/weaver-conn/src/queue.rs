//! Queue - 相手から届いた request / notification の順序付きキュー
//!
//! 受信と処理を切り離す。reader タスクが push し、dispatcher タスクが pop する。
//! handler が処理中に自分で RPC を発行しても reader は止まらず、
//! その RPC の reply を配送できる。

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::ConnError;

/// Queue はキャンセル可能な blocking pop を持つ上限なしの FIFO
///
/// # 実装詳細
/// - Mutex<VecDeque<T>> で要素を保持
/// - Notify で push を待機中の pop に通知
/// - producer / consumer はそれぞれ 1 つ
///
/// 要素は捨てない。接続が止まった時点で残っている要素は処理されないだけ。
pub struct Queue<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Queue<T> {
    /// 空の Queue を作成
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// `item` を末尾に追加する。ブロックしない
    pub fn push(&self, item: T) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(item);
        // 待機者がいなければ notify_one は permit を残す
        self.notify.notify_one();
    }

    /// 次の要素を待つ
    ///
    /// `token` がキャンセルされたら [`ConnError::Cancelled`] を返す。
    /// キャンセル済みなら要素が残っていても取り出さない。
    pub async fn pop(&self, token: &CancellationToken) -> Result<T, ConnError> {
        loop {
            if token.is_cancelled() {
                return Err(ConnError::Cancelled);
            }
            if let Some(item) = self.try_pop() {
                return Ok(item);
            }
            tokio::select! {
                _ = token.cancelled() => return Err(ConnError::Cancelled),
                _ = self.notify.notified() => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn try_pop(&self) -> Option<T> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}
