//! External collaborators of the `peerlink` endpoints.
//!
//! Every capability the core doesn't own (signalling relay, peer transport
//! engine, media capture and blob storage) is consumed through the traits of
//! this module, so they may be backed by a browser, a native WebRTC stack or
//! the in-memory [`loopback`] implementations.
//!
//! All the traits are single-threaded (`?Send`): the whole endpoint runs on
//! one logical execution context.
//!
//! [`loopback`]: crate::loopback

mod callback;
mod media;
mod peer_transport;
mod transport;

use derive_more::Display;

#[doc(inline)]
pub use self::{
    callback::Callback,
    media::{BlobStorage, LocalMediaStream, MediaRecorder},
    peer_transport::{
        DataChannel, DataChannelPayload, PeerTransport, PeerTransportEvent,
        PeerTransportEventHandler, PeerTransportFactory, RemoteTrack, SdpType,
    },
    transport::SignallingClient,
};

#[cfg(any(test, feature = "mockable"))]
#[doc(inline)]
pub use self::transport::MockSignallingClient;

/// Errors reported by external collaborators.
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum TransportError {
    /// Peer transport couldn't be created.
    #[display(fmt = "Failed to create peer transport: {}", _0)]
    CreateTransport(String),

    /// SDP offer or answer couldn't be created or applied.
    #[display(fmt = "SDP negotiation failed: {}", _0)]
    Negotiation(String),

    /// Remote ICE candidate was rejected.
    #[display(fmt = "Failed to add ICE candidate: {}", _0)]
    AddIceCandidate(String),

    /// Data channel couldn't be created.
    #[display(fmt = "Failed to create data channel: {}", _0)]
    CreateDataChannel(String),

    /// Local media stream couldn't be attached to the peer transport.
    #[display(fmt = "Failed to add local media stream: {}", _0)]
    AddLocalStream(String),

    /// Data channel is not open.
    #[display(fmt = "Data channel `{}` is not open", _0)]
    DataChannelClosed(String),

    /// Data channel refused an outgoing frame.
    #[display(fmt = "Failed to send data channel frame: {}", _0)]
    SendData(String),

    /// Signalling relay refused an outgoing envelope.
    #[display(fmt = "Failed to send signalling envelope: {}", _0)]
    SendSignal(String),

    /// Media capture couldn't be finalized.
    #[display(fmt = "Media capture failed: {}", _0)]
    Media(String),
}
