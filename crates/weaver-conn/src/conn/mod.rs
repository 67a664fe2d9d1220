//! Duplex RPC connection between an envelope and the weavelet it supervises.
//!
//! Both sides run the same machinery (see [`lifecycle`]): a reader task that
//! routes replies and queues everything else, a watcher that turns token
//! cancellation into a stop, and a dispatcher started by `serve` that hands
//! queued messages to the handler one at a time.

mod lifecycle;
mod envelope;
mod weavelet;

#[cfg(test)]
pub(crate) mod testing;

pub use self::envelope::{EnvelopeConn, EnvelopeHandler};
pub use self::weavelet::{WeaveletConn, WeaveletHandler};
