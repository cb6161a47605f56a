//! Peer-to-peer channel sessions negotiated over a signalling relay.
//!
//! Every conversation between two endpoints (or a group/broadcast channel)
//! is addressed by a deterministic [`ChannelIdentity`] and served by one
//! [`CallSession`], which negotiates a peer transport via SDP offer/answer
//! and ICE candidates exchanged through an opaque relay, completes a `ready`
//! handshake and then carries text, system commands and chunked media over a
//! data channel.
//!
//! Applications talk to a single [`MessageRouter`] constructed with the
//! [`platform`] collaborators of the endpoint.
//!
//! [`ChannelIdentity`]: proto::ChannelIdentity

#![allow(clippy::module_name_repetitions, clippy::must_use_candidate)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod conf;
pub mod log;
pub mod loopback;
pub mod platform;
pub mod registry;
pub mod router;
pub mod session;
pub mod utils;

#[doc(inline)]
pub use peerlink_signalling_proto as proto;

#[doc(inline)]
pub use self::{
    conf::Conf,
    registry::SessionRegistry,
    router::MessageRouter,
    session::{
        CallSession, CloseReason, NegotiationRole, SessionError, SessionPhase,
        StateError,
    },
};
