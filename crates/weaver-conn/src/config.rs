//! Connection options.

use serde::{Deserialize, Serialize};

/// Default limit on a single frame's body: 64 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 << 20;

/// Options shared by both sides of a connection.
///
/// Derives serde so hosts can embed it in their own config files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnOptions {
    /// Largest frame body, in bytes, that may be sent or received.
    pub max_frame_size: usize,
}

impl ConnOptions {
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

impl Default for ConnOptions {
    fn default() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}
