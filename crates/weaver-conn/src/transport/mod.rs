//! Transport port: moves whole messages across a pair of byte streams.
//!
//! The connection types only talk to the [`Transport`] trait, so they can run
//! over [`StreamTransport`] in production and over scripted fakes in tests.

mod frame;
mod stream;

pub use self::stream::StreamTransport;

use async_trait::async_trait;

use crate::error::ConnError;
use crate::protos::Message;

/// A duplex message transport.
///
/// # Concurrency contract
/// - `send` and `do_blocking_rpc` may be called from any number of tasks.
///   Frames never interleave.
/// - `recv` has exactly one caller at a time. That caller is also what
///   resolves pending `do_blocking_rpc` calls, so someone must keep calling
///   `recv` for blocking calls to complete.
/// - `cleanup` may be called from anywhere, any number of times. Only the
///   first call has an effect.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Messages this side writes.
    type Out: Message;
    /// Messages this side reads.
    type In: Message;

    /// Writes one message.
    async fn send(&self, msg: Self::Out) -> Result<(), ConnError>;

    /// Reads the next request or notification.
    ///
    /// Replies (negative ids) are handed to the matching `do_blocking_rpc`
    /// waiter and never returned.
    async fn recv(&self) -> Result<Self::In, ConnError>;

    /// Sends `req` under a fresh correlation id and waits for its reply.
    async fn do_blocking_rpc(&self, req: Self::Out) -> Result<Self::In, ConnError>;

    /// Closes both streams and fails every pending and future operation
    /// with `err`.
    fn cleanup(&self, err: ConnError);
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    type Out = T::Out;
    type In = T::In;

    async fn send(&self, msg: Self::Out) -> Result<(), ConnError> {
        (**self).send(msg).await
    }

    async fn recv(&self) -> Result<Self::In, ConnError> {
        (**self).recv().await
    }

    async fn do_blocking_rpc(&self, req: Self::Out) -> Result<Self::In, ConnError> {
        (**self).do_blocking_rpc(req).await
    }

    fn cleanup(&self, err: ConnError) {
        (**self).cleanup(err)
    }
}
