//! Messages exchanged over an established data channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ChannelIdentity, ParseError, SystemCommand};

/// Kind of a [`ChannelMessage`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageKind {
    /// Free text.
    Text,

    /// Recorded audio, payload is a local reference to the reassembled blob.
    Audio,

    /// Recorded video, payload is a local reference to the reassembled blob.
    Video,

    /// [`SystemCommand`] token.
    SystemCommand,
}

/// Direction of a [`ChannelMessage`] relative to the local endpoint.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the remote endpoint.
    In,

    /// Sent by the local endpoint.
    Out,
}

/// Describes a finished chunked transfer, carried by its trailer message.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TransferTrailer {
    /// ID of the transfer every chunk was tagged with.
    pub id: u32,

    /// Number of chunks sent.
    pub chunks: u32,

    /// Total number of payload bytes sent.
    pub length: u64,
}

/// Application message sent over a data channel.
///
/// Never mutated after creation, except that received messages are
/// normalized with [`ChannelMessage::normalize_inbound()`].
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    /// Channel this message belongs to.
    #[serde(rename = "dataChannel")]
    pub identity: ChannelIdentity,

    /// Kind of this message.
    #[serde(rename = "type")]
    pub kind: MessageKind,

    /// Direction of this message.
    pub direction: Direction,

    /// Text, [`SystemCommand`] token or local media reference.
    #[serde(rename = "channelmessage")]
    pub payload: String,

    /// Name of the sending user, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,

    /// Creation (or receipt) time.
    pub timestamp: DateTime<Utc>,

    /// Chunked transfer this message terminates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer: Option<TransferTrailer>,
}

impl ChannelMessage {
    /// Creates a new outgoing [`ChannelMessage`] stamped with the current
    /// time.
    #[must_use]
    pub fn outgoing<P: Into<String>>(
        identity: ChannelIdentity,
        kind: MessageKind,
        payload: P,
    ) -> Self {
        Self {
            identity,
            kind,
            direction: Direction::Out,
            payload: payload.into(),
            user_name: None,
            timestamp: Utc::now(),
            transfer: None,
        }
    }

    /// Creates a new outgoing [`MessageKind::SystemCommand`] message.
    #[inline]
    #[must_use]
    pub fn system_command(
        identity: ChannelIdentity,
        command: SystemCommand,
    ) -> Self {
        Self::outgoing(
            identity,
            MessageKind::SystemCommand,
            command.to_string(),
        )
    }

    /// Creates a new incoming [`ChannelMessage`] stamped with the current
    /// time.
    #[must_use]
    pub fn incoming<P: Into<String>>(
        identity: ChannelIdentity,
        kind: MessageKind,
        payload: P,
    ) -> Self {
        Self {
            direction: Direction::In,
            ..Self::outgoing(identity, kind, payload)
        }
    }

    /// Sets the sending user name.
    #[inline]
    #[must_use]
    pub fn with_user_name<N: Into<String>>(mut self, name: N) -> Self {
        self.user_name = Some(name.into());
        self
    }

    /// Attaches [`TransferTrailer`] to this message.
    #[inline]
    #[must_use]
    pub fn with_transfer(mut self, trailer: TransferTrailer) -> Self {
        self.transfer = Some(trailer);
        self
    }

    /// Stamps a received message with the local `identity`, inbound
    /// [`Direction`] and receipt time.
    ///
    /// The remote endpoint sees the same channel with swapped endpoints, so
    /// its `identity` is replaced with the local one.
    #[must_use]
    pub fn normalize_inbound(mut self, identity: ChannelIdentity) -> Self {
        self.identity = identity;
        self.direction = Direction::In;
        self.timestamp = Utc::now();
        self
    }

    /// Parses [`SystemCommand`] token of a [`MessageKind::SystemCommand`]
    /// message.
    ///
    /// Returns [`None`] for any other [`MessageKind`].
    ///
    /// # Errors
    ///
    /// With [`ParseError::UnknownCommand`] if the token is not known.
    pub fn system_command_token(
        &self,
    ) -> Option<Result<SystemCommand, ParseError>> {
        if self.kind == MessageKind::SystemCommand {
            Some(self.payload.parse())
        } else {
            None
        }
    }

    /// Decodes a [`ChannelMessage`] received as a text frame.
    ///
    /// # Errors
    ///
    /// With [`ParseError::Json`] if the frame is not a valid message.
    pub fn from_json(frame: &str) -> Result<Self, ParseError> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Encodes this [`ChannelMessage`] into a text frame.
    ///
    /// # Errors
    ///
    /// With [`ParseError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, ParseError> {
        Ok(serde_json::to_string(self)?)
    }
}
