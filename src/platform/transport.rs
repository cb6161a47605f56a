//! Signalling relay client.

use futures::stream::LocalBoxStream;
use peerlink_signalling_proto::SignallingEnvelope;
use tracerr::Traced;

use super::TransportError;

/// Client of a best-effort signalling relay forwarding
/// [`SignallingEnvelope`]s between endpoints.
///
/// Delivery is assumed to be at-most-once and not ordered across different
/// [`ChannelIdentity`]s. Nothing is deduplicated or retransmitted.
///
/// [`ChannelIdentity`]: peerlink_signalling_proto::ChannelIdentity
#[cfg_attr(any(test, feature = "mockable"), mockall::automock)]
pub trait SignallingClient {
    /// Sends the provided [`SignallingEnvelope`] without waiting for any
    /// delivery confirmation.
    ///
    /// # Errors
    ///
    /// With [`TransportError::SendSignal`] if the relay refuses the envelope.
    fn send(
        &self,
        envelope: &SignallingEnvelope,
    ) -> Result<(), Traced<TransportError>>;

    /// Returns [`LocalBoxStream`] of all [`SignallingEnvelope`]s addressed to
    /// this endpoint.
    fn subscribe(&self) -> LocalBoxStream<'static, SignallingEnvelope>;

    /// Returns [`LocalBoxStream`] firing once the connection to the relay is
    /// lost.
    fn on_connection_loss(&self) -> LocalBoxStream<'static, ()>;
}
