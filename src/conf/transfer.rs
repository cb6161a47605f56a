//! Chunked transfer settings.

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Settings of chunked media transfers over data channels.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize, SmartDefault,
)]
#[serde(default)]
pub struct Transfer {
    /// Maximum number of payload bytes carried by a single binary chunk.
    ///
    /// Both endpoints accept chunks of any size, so this only affects the
    /// sending side. Defaults to `16384`.
    #[default(16 * 1024)]
    pub chunk_size: usize,
}

impl Transfer {
    /// Returns [`Transfer::chunk_size`] clamped to at least one byte.
    #[inline]
    #[must_use]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.max(1)
    }
}
