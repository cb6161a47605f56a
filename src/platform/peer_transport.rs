//! Peer transport engine (ICE/SDP negotiation and data channels).

use std::{fmt, rc::Rc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::LocalBoxStream;
use medea_macro::dispatchable;
use peerlink_signalling_proto::{ChannelIdentity, IceCandidate, StreamKind};
use tracerr::Traced;

use super::{LocalMediaStream, TransportError};

/// Type of an [SDP] description.
///
/// [SDP]: https://tools.ietf.org/html/rfc4566
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SdpType {
    /// [`offer` type][1] of SDP.
    ///
    /// [1]: https://w3.org/TR/webrtc/#dom-rtcsdptype-offer
    Offer(String),

    /// [`answer` type][1] of SDP.
    ///
    /// [1]: https://w3.org/TR/webrtc/#dom-rtcsdptype-answer
    Answer(String),
}

/// Frame sent or received over a [`DataChannel`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DataChannelPayload {
    /// JSON-encoded [`ChannelMessage`].
    ///
    /// [`ChannelMessage`]: peerlink_signalling_proto::ChannelMessage
    Text(String),

    /// Raw chunk of a media transfer.
    Binary(Bytes),
}

/// Media track received from the remote endpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RemoteTrack {
    /// Channel the track has been received on.
    pub identity: ChannelIdentity,

    /// Kind of the received media.
    pub kind: StreamKind,

    /// Transport specific ID of the track.
    pub id: String,
}

/// Bidirectional data channel negotiated by a [`PeerTransport`].
pub trait DataChannel {
    /// Returns the label this [`DataChannel`] was created with.
    fn label(&self) -> String;

    /// Indicates whether frames can be sent over this [`DataChannel`].
    fn is_open(&self) -> bool;

    /// Sends the provided frame.
    ///
    /// # Errors
    ///
    /// With [`TransportError::DataChannelClosed`] if the channel is not
    /// open, or with [`TransportError::SendData`] if the frame is refused.
    fn send(
        &self,
        payload: DataChannelPayload,
    ) -> Result<(), Traced<TransportError>>;

    /// Closes this [`DataChannel`]. No-op if it's closed already.
    fn close(&self);
}

impl fmt::Debug for dyn DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label())
            .field("is_open", &self.is_open())
            .finish()
    }
}

/// Events emitted by a [`PeerTransport`].
#[dispatchable(self: &Self, async_trait(?Send))]
#[derive(Clone, Debug)]
pub enum PeerTransportEvent {
    /// Local ICE candidate has been discovered and should be sent to the
    /// remote endpoint.
    IceCandidateDiscovered {
        /// Discovered [`IceCandidate`].
        candidate: IceCandidate,
    },

    /// Data channel has been opened, either the locally created one or the
    /// one announced by the remote endpoint.
    DataChannelOpened {
        /// Opened [`DataChannel`].
        channel: Rc<dyn DataChannel>,
    },

    /// Frame has been received over an open data channel.
    DataChannelMessage {
        /// Received frame.
        payload: DataChannelPayload,
    },

    /// Remote endpoint added a media track.
    RemoteTrackAdded {
        /// Added [`RemoteTrack`].
        track: RemoteTrack,
    },

    /// Underlying connection has been closed and can't be used anymore.
    ConnectionClosed,
}

/// One ICE/SDP negotiated connection to a remote endpoint.
#[async_trait(?Send)]
pub trait PeerTransport {
    /// Generates an SDP offer.
    async fn create_offer(&self) -> Result<String, Traced<TransportError>>;

    /// Generates an SDP answer to the applied remote offer.
    async fn create_answer(&self) -> Result<String, Traced<TransportError>>;

    /// Applies the provided local SDP description.
    async fn set_local_description(
        &self,
        sdp: SdpType,
    ) -> Result<(), Traced<TransportError>>;

    /// Applies the provided remote SDP description.
    async fn set_remote_description(
        &self,
        sdp: SdpType,
    ) -> Result<(), Traced<TransportError>>;

    /// Applies the provided remote [`IceCandidate`].
    async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), Traced<TransportError>>;

    /// Creates a local [`DataChannel`] with the provided `label`.
    ///
    /// The returned [`DataChannel`] is also reported with
    /// [`PeerTransportEvent::DataChannelOpened`] once it's open.
    ///
    /// # Errors
    ///
    /// With [`TransportError::CreateDataChannel`] if the channel cannot be
    /// created.
    fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Rc<dyn DataChannel>, Traced<TransportError>>;

    /// Attaches tracks of the provided [`LocalMediaStream`] to this
    /// transport.
    ///
    /// # Errors
    ///
    /// With [`TransportError::AddLocalStream`] if the stream is rejected.
    fn add_local_stream(
        &self,
        stream: &Rc<dyn LocalMediaStream>,
    ) -> Result<(), Traced<TransportError>>;

    /// Returns [`LocalBoxStream`] of all the [`PeerTransportEvent`]s of this
    /// transport.
    fn on_event(&self) -> LocalBoxStream<'static, PeerTransportEvent>;

    /// Closes this transport and all of its [`DataChannel`]s.
    fn close(&self);
}

/// Creates [`PeerTransport`]s for [`CallSession`]s.
///
/// [`CallSession`]: crate::session::CallSession
pub trait PeerTransportFactory {
    /// Creates a new [`PeerTransport`] for the provided [`ChannelIdentity`].
    ///
    /// # Errors
    ///
    /// With [`TransportError::CreateTransport`] if the engine refuses to
    /// create a transport.
    fn create(
        &self,
        identity: &ChannelIdentity,
    ) -> Result<Rc<dyn PeerTransport>, Traced<TransportError>>;
}
