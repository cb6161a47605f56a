//! Enumerated lifecycle and control tokens.

use std::str::FromStr;

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{MessageKind, ParseError};

/// Lifecycle or control token exchanged as a typed message rather than free
/// text.
///
/// Only the handshake lifecycle and chunk transfer tokens are interpreted by
/// the endpoints themselves ([`SystemCommand::is_core()`]). The rest are
/// reserved for the application layer and passed through unmodified.
#[derive(
    Clone, Copy, Debug, Deserialize, Display, Eq, Hash, PartialEq, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum SystemCommand {
    /// Asks the remote endpoint to start a call.
    #[display(fmt = "initiate-call-connection")]
    InitiateCallConnection,

    /// Remote endpoint accepted a call request.
    #[display(fmt = "call-connection-initiated")]
    CallConnectionInitiated,

    /// Media stream sub-channel has been started.
    #[display(fmt = "call-connection-started")]
    CallConnectionStarted,

    /// Media stream sub-channel has been stopped.
    #[display(fmt = "call-connection-stopped")]
    CallConnectionStopped,

    /// Trailer of a chunked video transfer.
    #[display(fmt = "video-chunks-sent")]
    VideoChunksSent,

    /// Trailer of a chunked audio transfer.
    #[display(fmt = "audio-chunks-sent")]
    AudioChunksSent,

    /// Participant asks to join an ongoing call.
    #[display(fmt = "join-call-request")]
    JoinCallRequest,

    /// Join request has been accepted.
    #[display(fmt = "join-call-accepted")]
    JoinCallAccepted,

    /// Join request has been rejected.
    #[display(fmt = "join-call-rejected")]
    JoinCallRejected,

    /// Participant left a call.
    #[display(fmt = "leave-call")]
    LeaveCall,

    /// Participant muted its audio.
    #[display(fmt = "mute-audio")]
    MuteAudio,

    /// Participant unmuted its audio.
    #[display(fmt = "unmute-audio")]
    UnmuteAudio,

    /// Participant muted its video.
    #[display(fmt = "mute-video")]
    MuteVideo,

    /// Participant unmuted its video.
    #[display(fmt = "unmute-video")]
    UnmuteVideo,

    /// Call wasn't answered in time.
    #[display(fmt = "call-timeout")]
    CallTimeout,

    /// Remote endpoint is busy with another call.
    #[display(fmt = "call-busy")]
    CallBusy,
}

impl SystemCommand {
    /// All the known [`SystemCommand`]s.
    pub const ALL: [Self; 16] = [
        Self::InitiateCallConnection,
        Self::CallConnectionInitiated,
        Self::CallConnectionStarted,
        Self::CallConnectionStopped,
        Self::VideoChunksSent,
        Self::AudioChunksSent,
        Self::JoinCallRequest,
        Self::JoinCallAccepted,
        Self::JoinCallRejected,
        Self::LeaveCall,
        Self::MuteAudio,
        Self::UnmuteAudio,
        Self::MuteVideo,
        Self::UnmuteVideo,
        Self::CallTimeout,
        Self::CallBusy,
    ];

    /// Indicates whether this token is interpreted by the endpoints rather
    /// than only by the application.
    #[must_use]
    pub fn is_core(self) -> bool {
        matches!(
            self,
            Self::InitiateCallConnection
                | Self::CallConnectionInitiated
                | Self::CallConnectionStarted
                | Self::CallConnectionStopped
                | Self::VideoChunksSent
                | Self::AudioChunksSent
        )
    }

    /// Returns [`MessageKind`] of the media transfer this token terminates,
    /// if it's a chunk transfer trailer.
    #[must_use]
    pub fn transfer_kind(self) -> Option<MessageKind> {
        match self {
            Self::VideoChunksSent => Some(MessageKind::Video),
            Self::AudioChunksSent => Some(MessageKind::Audio),
            _ => None,
        }
    }

    /// Returns the trailer token of the provided media [`MessageKind`].
    #[must_use]
    pub fn trailer_for(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Video => Some(Self::VideoChunksSent),
            MessageKind::Audio => Some(Self::AudioChunksSent),
            MessageKind::Text | MessageKind::SystemCommand => None,
        }
    }
}

impl FromStr for SystemCommand {
    type Err = ParseError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|cmd| cmd.to_string() == token)
            .ok_or_else(|| ParseError::UnknownCommand(token.to_owned()))
    }
}
