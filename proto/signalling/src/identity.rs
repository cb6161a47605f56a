//! [`ChannelIdentity`] and the parties it addresses.

use std::{
    cmp::Ordering,
    convert::TryFrom,
    fmt,
    hash::{Hash, Hasher},
};

use derive_more::{Display, From};
use serde::{Deserialize, Serialize};

/// ID of a tenant all the channels belong to.
#[derive(
    Clone, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize,
)]
#[from(forward)]
pub struct TenantId(pub String);

/// ID of a [`Channel`].
#[derive(
    Clone, Debug, Deserialize, Display, Eq, From, Hash, PartialEq, Serialize,
)]
#[from(forward)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Orders IDs numerically when both are numbers and lexicographically
    /// otherwise, so `9` sorts before `10`.
    ///
    /// Numerically equal IDs spelled differently (`007` and `7`) are ordered
    /// by their spelling, so the order is total.
    fn endpoint_cmp(&self, other: &Self) -> Ordering {
        match (self.0.parse::<u64>(), other.0.parse::<u64>()) {
            (Ok(a), Ok(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

/// Kind of a logical party.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelKind {
    /// Single user.
    User,

    /// Group of users.
    Group,

    /// Broadcast source.
    Broadcast,
}

/// Logical party sourced from an external directory.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// ID of this [`Channel`].
    pub id: ChannelId,

    /// Kind of this [`Channel`].
    #[serde(rename = "type")]
    pub kind: ChannelKind,

    /// Human readable name of this [`Channel`].
    pub name: String,

    /// Members of a [`ChannelKind::Group`] channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_members: Option<Vec<ChannelId>>,
}

impl Channel {
    /// Creates a new [`ChannelKind::User`] [`Channel`].
    #[must_use]
    pub fn user<I: Into<ChannelId>, N: Into<String>>(id: I, name: N) -> Self {
        Self {
            id: id.into(),
            kind: ChannelKind::User,
            name: name.into(),
            group_members: None,
        }
    }

    /// Creates a new [`ChannelKind::Group`] [`Channel`] with the provided
    /// members.
    #[must_use]
    pub fn group<I, N>(id: I, name: N, members: Vec<ChannelId>) -> Self
    where
        I: Into<ChannelId>,
        N: Into<String>,
    {
        Self {
            id: id.into(),
            kind: ChannelKind::Group,
            name: name.into(),
            group_members: Some(members),
        }
    }
}

/// Type of a data channel between [`Channel`]s.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    /// Channel between two users.
    P2p,

    /// Channel of a persistent group.
    Group,

    /// Ad hoc group built around two users.
    TempGroup,

    /// One-to-many channel of a broadcaster.
    Broadcast,
}

impl ChannelType {
    /// Indicates whether [`ChannelIdentity::name()`] of this type doesn't
    /// depend on which endpoint is the initiator.
    #[inline]
    #[must_use]
    pub fn is_pairwise(self) -> bool {
        matches!(self, Self::P2p | Self::TempGroup)
    }
}

/// Kind of media a stream sub-channel carries.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamKind {
    /// Plain data channel.
    None,

    /// Audio stream.
    Audio,

    /// Video stream.
    Video,

    /// Screen sharing stream.
    Screen,
}

impl Default for StreamKind {
    #[inline]
    fn default() -> Self {
        Self::None
    }
}

impl StreamKind {
    /// Returns string representation used in [`ChannelIdentity::name()`].
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Screen => "screen",
        }
    }
}

/// Errors of building a [`ChannelIdentity`].
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum ConfigurationError {
    /// Tenant ID is not provided.
    #[display(fmt = "Tenant ID is missing")]
    MissingTenant,

    /// [`ChannelType`] is not provided.
    #[display(fmt = "Channel type is missing")]
    MissingChannelType,

    /// Endpoint required by the [`ChannelType`] is not provided.
    #[display(fmt = "`{}` channel is required by {:?} identity", _1, _0)]
    MissingEndpoint(ChannelType, &'static str),

    /// Received `dataChannelName` differs from the one derived locally.
    #[display(
        fmt = "Derived channel name `{}` doesn't match received `{}`",
        _0,
        _1
    )]
    NameMismatch(String, String),

    /// Operation requires a stream sub-channel identity.
    #[display(fmt = "`{}` is not a stream sub-channel", _0)]
    NotAStream(String),
}

impl std::error::Error for ConfigurationError {}

/// Deterministic identity of one signalling/data session between specific
/// endpoints (and, for streams, a specific media kind).
///
/// [`ChannelIdentity::name()`] is computed once on construction and is the
/// only thing [`ChannelIdentity`]s are compared and hashed by.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(try_from = "IdentityRepr", into = "IdentityRepr")]
pub struct ChannelIdentity {
    tenant_id: TenantId,
    channel_type: ChannelType,
    from: Option<Channel>,
    to: Option<Channel>,
    stream_kind: StreamKind,
    name: String,
}

impl ChannelIdentity {
    /// Builds a new [`ChannelIdentity`] deriving its name.
    ///
    /// # Errors
    ///
    /// With [`ConfigurationError`] if tenant ID, [`ChannelType`] or any
    /// endpoint required by that [`ChannelType`] is missing.
    pub fn new(
        tenant_id: Option<TenantId>,
        channel_type: Option<ChannelType>,
        from: Option<Channel>,
        to: Option<Channel>,
        stream_kind: StreamKind,
    ) -> Result<Self, ConfigurationError> {
        let tenant_id = tenant_id
            .filter(|t| !t.0.is_empty())
            .ok_or(ConfigurationError::MissingTenant)?;
        let channel_type =
            channel_type.ok_or(ConfigurationError::MissingChannelType)?;
        let name = derive_name(
            &tenant_id,
            channel_type,
            from.as_ref(),
            to.as_ref(),
            stream_kind,
        )?;

        Ok(Self {
            tenant_id,
            channel_type,
            from,
            to,
            stream_kind,
            name,
        })
    }

    /// Builds a [`ChannelType::P2p`] data [`ChannelIdentity`] between two
    /// users.
    ///
    /// # Errors
    ///
    /// See [`ChannelIdentity::new()`].
    pub fn p2p<T: Into<TenantId>>(
        tenant_id: T,
        from: Channel,
        to: Channel,
    ) -> Result<Self, ConfigurationError> {
        Self::new(
            Some(tenant_id.into()),
            Some(ChannelType::P2p),
            Some(from),
            Some(to),
            StreamKind::None,
        )
    }

    /// Returns the derived name of this [`ChannelIdentity`].
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tenant this [`ChannelIdentity`] belongs to.
    #[inline]
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Returns [`ChannelType`] of this [`ChannelIdentity`].
    #[inline]
    #[must_use]
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// Returns the initiating endpoint.
    #[inline]
    #[must_use]
    pub fn from(&self) -> Option<&Channel> {
        self.from.as_ref()
    }

    /// Returns the target endpoint.
    #[inline]
    #[must_use]
    pub fn to(&self) -> Option<&Channel> {
        self.to.as_ref()
    }

    /// Returns [`StreamKind`] of this [`ChannelIdentity`].
    #[inline]
    #[must_use]
    pub fn stream_kind(&self) -> StreamKind {
        self.stream_kind
    }

    /// Indicates whether this [`ChannelIdentity`] addresses a stream
    /// sub-channel rather than a plain data channel.
    #[inline]
    #[must_use]
    pub fn is_stream(&self) -> bool {
        self.stream_kind != StreamKind::None
    }

    /// Returns this [`ChannelIdentity`] as seen by the other endpoint.
    ///
    /// Only pairwise ([`ChannelType::is_pairwise()`]) identities are swapped,
    /// so the [`ChannelIdentity::name()`] never changes.
    #[must_use]
    pub fn reversed(&self) -> Self {
        if !self.channel_type.is_pairwise() {
            return self.clone();
        }
        Self {
            from: self.to.clone(),
            to: self.from.clone(),
            ..self.clone()
        }
    }

    /// Returns an identity of the `kind` stream sub-channel between the same
    /// endpoints.
    #[must_use]
    pub fn with_stream(&self, kind: StreamKind) -> Self {
        let mut identity = self.clone();
        identity.stream_kind = kind;
        identity.name = derive_name_unchecked(
            &identity.tenant_id,
            identity.channel_type,
            identity.from.as_ref(),
            identity.to.as_ref(),
            kind,
        );
        identity
    }

    /// Returns an identity of the plain data channel between the same
    /// endpoints.
    #[inline]
    #[must_use]
    pub fn data_identity(&self) -> Self {
        self.with_stream(StreamKind::None)
    }

    /// Indicates whether both identities address the same endpoints,
    /// regardless of their [`StreamKind`]s.
    #[must_use]
    pub fn same_endpoints(&self, other: &Self) -> bool {
        self.data_identity().name == other.data_identity().name
    }
}

impl PartialEq for ChannelIdentity {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ChannelIdentity {}

impl Hash for ChannelIdentity {
    #[inline]
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ChannelIdentity {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Wire representation of a [`ChannelIdentity`].
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRepr {
    tenant_id: Option<TenantId>,
    data_channel_type: Option<ChannelType>,
    #[serde(default)]
    from_channel: Option<Channel>,
    #[serde(default)]
    to_channel: Option<Channel>,
    #[serde(default)]
    stream_type: StreamKind,
    #[serde(default)]
    data_channel_name: Option<String>,
}

impl TryFrom<IdentityRepr> for ChannelIdentity {
    type Error = ConfigurationError;

    fn try_from(repr: IdentityRepr) -> Result<Self, Self::Error> {
        let identity = Self::new(
            repr.tenant_id,
            repr.data_channel_type,
            repr.from_channel,
            repr.to_channel,
            repr.stream_type,
        )?;
        match repr.data_channel_name {
            Some(received) if received != identity.name => Err(
                ConfigurationError::NameMismatch(identity.name, received),
            ),
            _ => Ok(identity),
        }
    }
}

impl From<ChannelIdentity> for IdentityRepr {
    fn from(identity: ChannelIdentity) -> Self {
        Self {
            tenant_id: Some(identity.tenant_id),
            data_channel_type: Some(identity.channel_type),
            from_channel: identity.from,
            to_channel: identity.to,
            stream_type: identity.stream_kind,
            data_channel_name: Some(identity.name),
        }
    }
}

/// Derives [`ChannelIdentity::name()`] checking that all the required
/// endpoints are present.
fn derive_name(
    tenant_id: &TenantId,
    channel_type: ChannelType,
    from: Option<&Channel>,
    to: Option<&Channel>,
    stream_kind: StreamKind,
) -> Result<String, ConfigurationError> {
    let missing = |endpoint| {
        Err(ConfigurationError::MissingEndpoint(channel_type, endpoint))
    };
    match channel_type {
        ChannelType::P2p | ChannelType::TempGroup => {
            if from.is_none() {
                return missing("from");
            }
            if to.is_none() {
                return missing("to");
            }
        }
        ChannelType::Group => {
            if to.is_none() {
                return missing("to");
            }
        }
        ChannelType::Broadcast => {
            if from.is_none() {
                return missing("from");
            }
        }
    }
    Ok(derive_name_unchecked(
        tenant_id,
        channel_type,
        from,
        to,
        stream_kind,
    ))
}

/// Derives [`ChannelIdentity::name()`] of already validated parts.
fn derive_name_unchecked(
    tenant_id: &TenantId,
    channel_type: ChannelType,
    from: Option<&Channel>,
    to: Option<&Channel>,
    stream_kind: StreamKind,
) -> String {
    let mut name = format!("tenant-{}", tenant_id);
    match stream_kind {
        StreamKind::None => name.push_str("-data"),
        kind => {
            name.push_str("-stream-");
            name.push_str(kind.as_str());
        }
    }

    let id_of = |c: Option<&Channel>| {
        c.map(|c| c.id.clone()).unwrap_or_else(|| ChannelId(String::new()))
    };
    match channel_type {
        ChannelType::P2p | ChannelType::TempGroup => {
            let (from, to) = (id_of(from), id_of(to));
            let (first, second) =
                if from.endpoint_cmp(&to) == Ordering::Greater {
                    (to, from)
                } else {
                    (from, to)
                };
            let prefix = if channel_type == ChannelType::P2p {
                "p2p"
            } else {
                "tempgrp"
            };
            name.push_str(&format!(
                "-{}-usr-{}-usr-{}",
                prefix, first, second
            ));
        }
        ChannelType::Group => {
            name.push_str(&format!("-grp-{}", id_of(to)));
        }
        ChannelType::Broadcast => {
            name.push_str(&format!("-broadcast-{}", id_of(from)));
        }
    }
    name
}
