//! weaver-conn
//!
//! Duplex RPC channel between an envelope and the weavelet process it
//! supervises.
//!
//! # Modules
//! - **protos**: wire messages (`EnvelopeMsg`, `WeaveletMsg`) and their payloads
//! - **transport**: length-prefixed JSON framing and reply correlation
//! - **queue**: ordered blocking queue between the reader and the dispatcher
//! - **conn**: `EnvelopeConn` / `WeaveletConn`, handshake, lifecycle, typed RPCs
//! - **metrics**: turns weavelet metric deltas into full snapshots
//! - **config**: connection options
//! - **error**: error types
//!
//! # Logging
//! The crate emits `tracing` events and never installs a subscriber; the
//! host process decides where they go.

pub mod config;
pub mod conn;
pub mod error;
pub mod metrics;
pub mod protos;
pub mod queue;
pub mod transport;

pub use config::ConnOptions;
pub use conn::{EnvelopeConn, EnvelopeHandler, WeaveletConn, WeaveletHandler};
pub use error::{ConnError, HandlerError, MetricsError, TransportError};
pub use metrics::{MetricSnapshot, MetricsImporter};
pub use transport::{StreamTransport, Transport};
