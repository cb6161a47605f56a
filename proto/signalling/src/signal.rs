//! Envelopes forwarded by a signalling relay.

use medea_macro::dispatchable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ChannelIdentity, ParseError, SystemCommand};

/// Represents [RTCIceCandidateInit][1] object.
///
/// [1]: https://www.w3.org/TR/webrtc/#dom-rtcicecandidateinit
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
}

/// Type tag of a [`SignallingEnvelope`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Ready,
    Bye,
    SystemCommand,
}

/// Envelope routed by a signalling relay purely on its
/// [`SignallingEnvelope::data_channel_label`].
///
/// `data` stays opaque until [`SignallingEnvelope::into_parts()`] is called,
/// so a relay can forward envelopes without knowing their payloads.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignallingEnvelope {
    /// Type of the carried [`Signal`].
    #[serde(rename = "type")]
    pub kind: SignalKind,

    /// [`ChannelIdentity`] this envelope is addressed to.
    pub data_channel_label: ChannelIdentity,

    /// Opaque payload of the [`Signal`].
    #[serde(default)]
    pub data: Value,
}

/// Typed content of a [`SignallingEnvelope`].
#[dispatchable(self: &Self, async_trait(?Send))]
#[derive(Clone, Debug, PartialEq)]
pub enum Signal {
    /// SDP offer of the initiating endpoint.
    Offer {
        /// SDP offer.
        sdp: String,
    },

    /// SDP answer of the receiving endpoint.
    Answer {
        /// SDP answer.
        sdp: String,
    },

    /// ICE candidate discovered by the sending endpoint.
    Candidate {
        /// Discovered [`IceCandidate`].
        candidate: IceCandidate,
    },

    /// Sending endpoint has a remote description and has processed at least
    /// one remote ICE candidate.
    Ready,

    /// Sending endpoint tears the session down.
    Bye,

    /// [`SystemCommand`] delivered through the relay, for endpoints without
    /// an open data channel.
    SystemCommand {
        /// Delivered [`SystemCommand`].
        command: SystemCommand,
    },
}

impl Signal {
    /// Returns [`SignalKind`] of this [`Signal`].
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer { .. } => SignalKind::Answer,
            Self::Candidate { .. } => SignalKind::Candidate,
            Self::Ready => SignalKind::Ready,
            Self::Bye => SignalKind::Bye,
            Self::SystemCommand { .. } => SignalKind::SystemCommand,
        }
    }
}

impl SignallingEnvelope {
    /// Wraps the provided [`Signal`] into an envelope addressed to `label`.
    #[must_use]
    pub fn new(label: ChannelIdentity, signal: Signal) -> Self {
        let kind = signal.kind();
        let data = match signal {
            Signal::Offer { sdp } | Signal::Answer { sdp } => {
                Value::String(sdp)
            }
            Signal::Candidate { candidate } => {
                serde_json::to_value(candidate).unwrap_or_default()
            }
            Signal::Ready | Signal::Bye => Value::Null,
            Signal::SystemCommand { command } => {
                Value::String(command.to_string())
            }
        };
        Self {
            kind,
            data_channel_label: label,
            data,
        }
    }

    /// Decodes the opaque payload of this envelope.
    ///
    /// # Errors
    ///
    /// With [`ParseError`] if `data` doesn't match the envelope's
    /// [`SignalKind`].
    pub fn into_parts(self) -> Result<(ChannelIdentity, Signal), ParseError> {
        let signal = match self.kind {
            SignalKind::Offer => Signal::Offer {
                sdp: serde_json::from_value(self.data)?,
            },
            SignalKind::Answer => Signal::Answer {
                sdp: serde_json::from_value(self.data)?,
            },
            SignalKind::Candidate => Signal::Candidate {
                candidate: serde_json::from_value(self.data)?,
            },
            SignalKind::Ready => Signal::Ready,
            SignalKind::Bye => Signal::Bye,
            SignalKind::SystemCommand => Signal::SystemCommand {
                command: serde_json::from_value(self.data)?,
            },
        };
        Ok((self.data_channel_label, signal))
    }

    /// Encodes this envelope into a JSON text.
    ///
    /// # Errors
    ///
    /// With [`ParseError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ParseError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes an envelope from a JSON text.
    ///
    /// # Errors
    ///
    /// With [`ParseError::Json`] if the text is not a valid envelope.
    pub fn from_json(text: &str) -> Result<Self, ParseError> {
        Ok(serde_json::from_str(text)?)
    }
}
