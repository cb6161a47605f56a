//! Registry of [`CallSession`]s keyed by [`ChannelIdentity::name()`].

use std::{cell::RefCell, collections::HashMap, rc::Rc};

use peerlink_signalling_proto::ChannelIdentity;

use crate::session::{
    CallSession, CloseReason, SessionContext, SessionPhase, WeakCallSession,
};

/// Creates, reuses and evicts [`CallSession`]s.
///
/// Holds at most one live [`CallSession`] per [`ChannelIdentity::name()`].
/// Stream sub-channels have their own names, so they always get sessions
/// independent from the data session of the same endpoints.
#[derive(Clone)]
pub struct SessionRegistry(Rc<InnerRegistry>);

struct InnerRegistry {
    /// Collaborators passed to every created [`CallSession`].
    ctx: SessionContext,

    /// Registered [`CallSession`]s.
    sessions: RefCell<HashMap<String, CallSession>>,
}

impl SessionRegistry {
    /// Creates a new empty [`SessionRegistry`].
    #[must_use]
    pub fn new(ctx: SessionContext) -> Self {
        Self(Rc::new(InnerRegistry {
            ctx,
            sessions: RefCell::default(),
        }))
    }

    /// Returns the [`CallSession`] registered for the provided identity,
    /// creating a new one if there is none or the registered one is
    /// [`SessionPhase::Closed`].
    pub fn get_or_create(&self, identity: &ChannelIdentity) -> CallSession {
        if let Some(session) = self.get(identity.name()) {
            if session.phase() != SessionPhase::Closed {
                return session;
            }
        }

        let session = CallSession::new(identity.clone(), self.0.ctx.clone());
        let name = identity.name().to_owned();
        let weak_session = session.downgrade();
        let weak_registry = Rc::downgrade(&self.0);
        session.on_close(move || {
            if let Some(registry) = weak_registry.upgrade() {
                registry.remove_if_same(&name, &weak_session);
            }
        });

        log::debug!("Registered new session `{}`", identity);
        drop(
            self.0
                .sessions
                .borrow_mut()
                .insert(identity.name().to_owned(), session.clone()),
        );
        session
    }

    /// Returns the [`CallSession`] registered under the provided name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<CallSession> {
        self.0.sessions.borrow().get(name).cloned()
    }

    /// Removes the [`CallSession`] of the provided identity, closing it with
    /// [`CloseReason::Local`].
    ///
    /// Returns `false` if no session was registered.
    pub fn evict(&self, identity: &ChannelIdentity) -> bool {
        let removed = self.0.sessions.borrow_mut().remove(identity.name());
        match removed {
            Some(session) => {
                log::debug!("Evicting session `{}`", identity);
                session.close(CloseReason::Local);
                true
            }
            None => false,
        }
    }

    /// Returns all the registered stream sub-channel sessions addressing the
    /// same endpoints as the provided identity.
    #[must_use]
    pub fn stream_sessions(
        &self,
        identity: &ChannelIdentity,
    ) -> Vec<CallSession> {
        self.0
            .sessions
            .borrow()
            .values()
            .filter(|s| {
                let own = s.identity();
                own.is_stream() && own.same_endpoints(identity)
            })
            .cloned()
            .collect()
    }

    /// Closes and removes all the registered sessions.
    pub fn close_all(&self, reason: CloseReason) {
        let sessions: Vec<_> =
            self.0.sessions.borrow_mut().drain().map(|(_, s)| s).collect();
        for session in sessions {
            session.close(reason);
        }
    }

    /// Returns number of the registered sessions.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.sessions.borrow().len()
    }

    /// Indicates whether no sessions are registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.sessions.borrow().is_empty()
    }
}

impl InnerRegistry {
    /// Removes the session registered under the provided name, if it's the
    /// one `weak_session` points to.
    fn remove_if_same(&self, name: &str, weak_session: &WeakCallSession) {
        let mut sessions = self.sessions.borrow_mut();
        if sessions.get(name).map_or(false, |s| weak_session.points_to(s)) {
            drop(sessions.remove(name));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use futures::executor::LocalPool;
    use peerlink_signalling_proto::{Channel, ChannelIdentity, StreamKind};

    use crate::{
        conf,
        loopback::{InMemoryBlobStorage, LoopbackNetwork, LoopbackSignalling},
        session::{CloseReason, SessionContext, SessionPhase},
    };

    use super::SessionRegistry;

    fn registry(pool: &LocalPool) -> SessionRegistry {
        let (signalling, _) = LoopbackSignalling::pair();
        SessionRegistry::new(SessionContext {
            signalling: Rc::new(signalling),
            transports: Rc::new(LoopbackNetwork::new().endpoint()),
            blobs: Rc::new(InMemoryBlobStorage::default()),
            spawner: Rc::new(pool.spawner()),
            transfer: conf::Transfer::default(),
        })
    }

    fn identity() -> ChannelIdentity {
        ChannelIdentity::p2p(
            "1",
            Channel::user("1", "alice"),
            Channel::user("2", "bob"),
        )
        .unwrap()
    }

    #[test]
    fn get_or_create_is_idempotent() {
        let pool = LocalPool::new();
        let registry = registry(&pool);

        let first = registry.get_or_create(&identity());
        let second = registry.get_or_create(&identity().reversed());

        assert!(first.ptr_eq(&second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn stream_identity_gets_separate_session() {
        let pool = LocalPool::new();
        let registry = registry(&pool);

        let data = registry.get_or_create(&identity());
        let video =
            registry.get_or_create(&identity().with_stream(StreamKind::Video));

        assert!(!data.ptr_eq(&video));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.stream_sessions(&identity()).len(), 1);
    }

    #[test]
    fn closed_session_is_replaced() {
        let pool = LocalPool::new();
        let registry = registry(&pool);

        let first = registry.get_or_create(&identity());
        first.close(CloseReason::Local);
        assert!(registry.is_empty());

        let second = registry.get_or_create(&identity());
        assert!(!first.ptr_eq(&second));
        assert_eq!(second.phase(), SessionPhase::Idle);

        first.close(CloseReason::Local);
        assert!(registry.get(identity().name()).is_some());
    }

    #[test]
    fn evict_unknown_identity_is_noop() {
        let pool = LocalPool::new();
        let registry = registry(&pool);

        assert!(!registry.evict(&identity()));

        let session = registry.get_or_create(&identity());
        assert!(registry.evict(&identity()));
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert!(!registry.evict(&identity()));
    }

    #[test]
    fn close_all_closes_every_session() {
        let pool = LocalPool::new();
        let registry = registry(&pool);
        let data = registry.get_or_create(&identity());
        let audio =
            registry.get_or_create(&identity().with_stream(StreamKind::Audio));

        registry.close_all(CloseReason::SignallingLost);

        assert!(registry.is_empty());
        assert_eq!(data.close_reason(), Some(CloseReason::SignallingLost));
        assert_eq!(audio.close_reason(), Some(CloseReason::SignallingLost));
    }
}
