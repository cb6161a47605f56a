//! Signalling and data channel protocol shared by `peerlink` endpoints.
//!
//! Two endpoints never talk to each other directly before a peer transport is
//! negotiated. Everything they exchange until then is a
//! [`SignallingEnvelope`] forwarded by an opaque relay, and everything after
//! that is either a JSON-encoded [`ChannelMessage`] or a raw binary chunk sent
//! over the negotiated data channel.
//!
//! Both kinds of traffic are addressed with a [`ChannelIdentity`], whose
//! [`ChannelIdentity::name()`] is deterministic and identical on both sides.

#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod command;
pub mod identity;
pub mod message;
pub mod signal;

use derive_more::Display;

#[doc(inline)]
pub use self::{
    command::SystemCommand,
    identity::{
        Channel, ChannelId, ChannelIdentity, ChannelKind, ChannelType,
        ConfigurationError, StreamKind, TenantId,
    },
    message::{ChannelMessage, Direction, MessageKind, TransferTrailer},
    signal::{
        IceCandidate, Signal, SignalHandler, SignalKind, SignallingEnvelope,
    },
};

/// Errors of decoding data received from a remote endpoint.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ParseError {
    /// Payload is not a valid JSON of the expected shape.
    #[display(fmt = "Failed to parse JSON payload: {}", _0)]
    Json(String),

    /// Token doesn't name any known [`SystemCommand`].
    #[display(fmt = "Unknown system command: {}", _0)]
    UnknownCommand(String),

    /// Binary frame is too short to contain a chunk header.
    #[display(fmt = "Binary frame of {} bytes has no chunk header", _0)]
    MalformedChunk(usize),

    /// Transfer trailer carries no [`TransferTrailer`].
    #[display(fmt = "`{}` trailer carries no transfer description", _0)]
    MissingTrailer(SystemCommand),

    /// Trailer doesn't match the chunks buffered for its transfer.
    #[display(
        fmt = "Transfer {} is incomplete: expected {} chunks ({} bytes), got \
               {} chunks ({} bytes)",
        id,
        expected_chunks,
        expected_length,
        chunks,
        length
    )]
    IncompleteTransfer {
        /// ID of the transfer.
        id: u32,
        /// Chunks count announced by the trailer.
        expected_chunks: u32,
        /// Total length announced by the trailer.
        expected_length: u64,
        /// Chunks actually buffered.
        chunks: u32,
        /// Bytes actually buffered.
        length: u64,
    },
}

impl std::error::Error for ParseError {}

impl From<serde_json::Error> for ParseError {
    #[inline]
    fn from(err: serde_json::Error) -> Self {
        Self::Json(err.to_string())
    }
}
