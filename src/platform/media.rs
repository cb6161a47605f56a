//! Local media capture and blob storage.

use async_trait::async_trait;
use bytes::Bytes;
use peerlink_signalling_proto::{MessageKind, StreamKind};
use tracerr::Traced;

use super::TransportError;

/// Live local media (camera, microphone or screen capture) attached to a
/// stream sub-channel.
pub trait LocalMediaStream {
    /// Returns kinds of all the tracks of this stream.
    fn kinds(&self) -> Vec<StreamKind>;

    /// Stops all the tracks of this stream, releasing the capture devices.
    /// No-op if the stream is stopped already.
    fn stop(&self);

    /// Indicates whether this stream has been stopped.
    fn is_stopped(&self) -> bool;
}

/// Recorder of audio and video messages.
#[async_trait(?Send)]
pub trait MediaRecorder {
    /// Finalizes a prior capture of the provided [`MessageKind`] and returns
    /// its encoded bytes.
    async fn finish(
        &self,
        kind: MessageKind,
    ) -> Result<Bytes, Traced<TransportError>>;
}

/// Storage of reassembled media blobs.
pub trait BlobStorage {
    /// Stores the provided bytes and returns a local reference to them (e.g.
    /// an object URL).
    fn store(&self, kind: MessageKind, bytes: Bytes) -> String;

    /// Returns bytes stored under the provided `reference`, if any.
    fn get(&self, reference: &str) -> Option<Bytes>;
}
