//! Error types for the envelope/weavelet channel.
//!
//! `ConnError` is `Clone` because a single terminal error is handed to every
//! operation that was blocked on the connection when it stopped.

use std::sync::Arc;

use thiserror::Error;

/// Failures of the byte-stream transport itself.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("encode message: {0}")]
    Encode(String),

    #[error("decode message: {0}")]
    Decode(String),

    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

/// Error of a connection between an envelope and a weavelet.
#[derive(Debug, Clone, Error)]
pub enum ConnError {
    /// The peer's first frame did not carry its identity, or the handshake
    /// I/O failed. Fatal to construction.
    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// An inbound message matched none of the known variants.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An RPC reply carried a payload of the wrong kind. The connection stays up.
    #[error("malformed reply: expected {expected}, got {got}")]
    UnexpectedReply {
        expected: &'static str,
        got: &'static str,
    },

    /// An RPC reply carried no payload. The connection stays up.
    #[error("malformed reply: missing {expected}")]
    MissingReply { expected: &'static str },

    #[error("connection cancelled")]
    Cancelled,

    /// The peer's handler failed; the text is the peer's error verbatim.
    #[error("{0}")]
    Application(String),

    /// A local notification handler failed.
    #[error("handler failed: {0}")]
    Handler(String),

    /// A background task of the connection panicked.
    #[error("background task panicked: {0}")]
    TaskPanicked(String),

    #[error("connection to {peer} broken: {source}")]
    Broken {
        peer: &'static str,
        source: Box<ConnError>,
    },

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("connection is already being served")]
    AlreadyServing,
}

impl ConnError {
    /// Wraps a transport failure seen by an outgoing RPC.
    pub(crate) fn broken(peer: &'static str, err: ConnError) -> Self {
        match err {
            ConnError::Broken { .. } => err,
            other => ConnError::Broken {
                peer,
                source: Box::new(other),
            },
        }
    }

    /// True if the connection ended because its lifetime token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ConnError::Cancelled => true,
            ConnError::Broken { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True if an RPC reply had the wrong shape but the connection is healthy.
    pub fn is_malformed_reply(&self) -> bool {
        matches!(
            self,
            ConnError::UnexpectedReply { .. } | ConnError::MissingReply { .. }
        )
    }
}

impl From<std::io::Error> for ConnError {
    fn from(err: std::io::Error) -> Self {
        ConnError::Transport(err.into())
    }
}

/// Error returned by handler implementations.
///
/// `Display` is the bare message, so the text that reaches the peer in a
/// reply's error string is exactly what the handler produced.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Errors raised while importing a metrics update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MetricsError {
    #[error("value for unknown metric id={0}")]
    UnknownMetric(u64),

    #[error("metric id={id} redefined from {old} to {new}")]
    Redefined { id: u64, old: String, new: String },
}
