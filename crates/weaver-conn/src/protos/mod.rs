//! Wire messages exchanged between an envelope and a weavelet.
//!
//! Every message is `{ id, error, payload }` where `payload` is a closed
//! tagged union. The envelope sends [`EnvelopeMsg`] and receives
//! [`WeaveletMsg`]; the weavelet does the opposite.
//!
//! # Correlation ids
//! - An RPC initiator assigns a positive id, unique among its outstanding calls.
//! - The responder replies with the negated id.
//! - Notifications carry id 0.
//! - So a negative id always means "reply", anything else is a fresh request.

mod envelope;
mod types;
mod weavelet;

pub use self::envelope::{EnvelopeMsg, EnvelopePayload};
pub use self::types::*;
pub use self::weavelet::{WeaveletMsg, WeaveletPayload};

use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};

/// A payload union carried in a message's `payload` field.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire tag of every variant this side understands.
    const TAGS: &'static [&'static str];
}

/// Behaviour shared by both directions' message types.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Payload: Payload;

    fn id(&self) -> i64;

    fn set_id(&mut self, id: i64);

    /// Error string of a reply. Empty when the peer's handler succeeded.
    fn error(&self) -> &str;

    /// Short name of the populated payload, for logs and errors.
    fn kind(&self) -> &'static str;

    fn into_payload(self) -> Option<Self::Payload>;

    fn is_reply(&self) -> bool {
        self.id() < 0
    }
}

/// Renders a handler result's error the way replies carry it.
pub(crate) fn error_string<T, E: std::fmt::Display>(result: &Result<T, E>) -> String {
    match result {
        Ok(_) => String::new(),
        Err(err) => err.to_string(),
    }
}

/// Decodes a `payload` field, reading a tag this side does not know as
/// "no payload".
///
/// A newer peer may send variants we have never heard of. They must reach
/// the dispatcher as an empty message (a protocol violation), not fail
/// decoding. A known tag with a malformed body is still a decode error.
pub(crate) fn payload_or_unknown<'de, D, P>(deserializer: D) -> Result<Option<P>, D::Error>
where
    D: Deserializer<'de>,
    P: Payload,
{
    let Some(value) = Option::<serde_json::Value>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if let serde_json::Value::Object(map) = &value
        && map.len() == 1
        && let Some(tag) = map.keys().next()
        && !P::TAGS.contains(&tag.as_str())
    {
        tracing::debug!(tag = %tag, "unknown payload tag");
        return Ok(None);
    }
    P::deserialize(value).map(Some).map_err(D::Error::custom)
}
