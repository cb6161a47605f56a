//! Application façade routing messages between the application and
//! [`CallSession`]s.

use std::{cell::RefCell, collections::HashMap, ops::Deref as _, rc::Rc};

use futures::{
    channel::mpsc,
    task::{LocalSpawn, LocalSpawnExt as _},
    StreamExt as _,
};
use peerlink_signalling_proto::{
    ChannelIdentity, ChannelMessage, ConfigurationError, MessageKind, Signal,
    SignallingEnvelope, SystemCommand,
};
use tracerr::Traced;

use crate::{
    conf::{self, Conf},
    platform::{
        BlobStorage, Callback, LocalMediaStream, MediaRecorder,
        PeerTransportFactory, RemoteTrack, SignallingClient,
    },
    registry::SessionRegistry,
    session::{
        CallSession, CloseReason, SessionContext, SessionError, SessionEvent,
        SessionEventHandler, SessionPhase, StateError, WeakCallSession,
    },
    utils::{self, TaskHandle},
};

/// Events processed by the [`MessageRouter`] task.
enum RouterEvent {
    /// Envelope received from the signalling relay.
    Envelope(SignallingEnvelope),

    /// Connection to the signalling relay has been lost.
    ConnectionLost,

    /// Event of a bound [`CallSession`].
    Session(SessionEvent),
}

/// Single entry point of an application into `peerlink`.
///
/// Creates [`CallSession`]s on demand, dispatches inbound signalling to them,
/// keeps an append-only history of [`ChannelMessage`]s per channel and
/// notifies the application via the registered callbacks.
///
/// Façade operations never propagate errors: failures are logged and
/// reported as `false` or [`None`].
#[derive(Clone)]
pub struct MessageRouter(Rc<InnerRouter>);

struct InnerRouter {
    /// Registry of all the [`CallSession`]s of this endpoint.
    registry: SessionRegistry,

    /// Client of the signalling relay.
    signalling: Rc<dyn SignallingClient>,

    /// Recorder of audio and video messages.
    recorder: Rc<dyn MediaRecorder>,

    /// Storage of sent and received media.
    blobs: Rc<dyn BlobStorage>,

    /// Spawner of the [`CallSession`] event forwarders.
    spawner: Rc<dyn LocalSpawn>,

    /// Signalling relay settings.
    conf: conf::Signalling,

    /// Sessions whose events are forwarded to this router.
    bindings: RefCell<HashMap<String, WeakCallSession>>,

    /// Sink of the forwarded [`SessionEvent`]s.
    session_events: mpsc::UnboundedSender<SessionEvent>,

    /// History of [`ChannelMessage`]s per [`ChannelIdentity::name()`].
    messages: RefCell<HashMap<String, Vec<ChannelMessage>>>,

    /// Callback for received text and media messages.
    on_message: Callback<ChannelMessage>,

    /// Callback for received [`SystemCommand`]s.
    on_system_command: Callback<(ChannelMessage, SystemCommand)>,

    /// Callback for remote media tracks.
    on_remote_stream: Callback<RemoteTrack>,

    /// Handle of the event processing task.
    task: RefCell<Option<TaskHandle>>,
}

impl MessageRouter {
    /// Creates a new [`MessageRouter`] and spawns its event processing task.
    #[must_use]
    pub fn new(
        conf: &Conf,
        signalling: Rc<dyn SignallingClient>,
        transports: Rc<dyn PeerTransportFactory>,
        recorder: Rc<dyn MediaRecorder>,
        blobs: Rc<dyn BlobStorage>,
        spawner: Rc<dyn LocalSpawn>,
    ) -> Self {
        let registry = SessionRegistry::new(SessionContext {
            signalling: Rc::clone(&signalling),
            transports,
            blobs: Rc::clone(&blobs),
            spawner: Rc::clone(&spawner),
            transfer: conf.transfer,
        });
        let (tx, mut session_events) = mpsc::unbounded();
        let mut envelopes = signalling.subscribe().fuse();
        let mut connection_loss = signalling.on_connection_loss().fuse();

        let inner = Rc::new(InnerRouter {
            registry,
            signalling,
            recorder,
            blobs,
            spawner: Rc::clone(&spawner),
            conf: conf.signalling,
            bindings: RefCell::default(),
            session_events: tx,
            messages: RefCell::default(),
            on_message: Callback::default(),
            on_system_command: Callback::default(),
            on_remote_stream: Callback::default(),
            task: RefCell::new(None),
        });

        let weak_inner = Rc::downgrade(&inner);
        let task = utils::spawn_abortable(&*spawner, async move {
            loop {
                let event = futures::select! {
                    envelope = envelopes.select_next_some() => {
                        RouterEvent::Envelope(envelope)
                    }
                    _ = connection_loss.select_next_some() => {
                        RouterEvent::ConnectionLost
                    }
                    event = session_events.select_next_some() => {
                        RouterEvent::Session(event)
                    }
                    complete => break,
                };

                let inner = match weak_inner.upgrade() {
                    Some(inner) => inner,
                    None => break,
                };
                match event {
                    RouterEvent::Envelope(envelope) => {
                        inner.handle_envelope(envelope);
                    }
                    RouterEvent::ConnectionLost => {
                        log::warn!("Signalling relay connection is lost");
                        inner.registry.close_all(CloseReason::SignallingLost);
                    }
                    RouterEvent::Session(event) => {
                        event.dispatch_with(inner.deref());
                    }
                }
            }
        });
        inner.task.replace(task);

        Self(inner)
    }

    /// Starts negotiating the provided [`ChannelIdentity`] as the offering
    /// side.
    ///
    /// Returns `true` once the SDP offer is sent, or if the session is
    /// negotiating or connected already. The session reaches
    /// [`SessionPhase::Connected`] asynchronously, see
    /// [`MessageRouter::phase()`].
    pub async fn connect(&self, identity: &ChannelIdentity) -> bool {
        let session = self.0.bind(identity);
        if session.phase() != SessionPhase::Idle {
            return true;
        }
        match session.start_call(None).await {
            Ok(()) => true,
            Err(e) => {
                log_error("connect", identity, &e);
                false
            }
        }
    }

    /// Closes the session of the provided [`ChannelIdentity`], notifying the
    /// remote endpoint.
    ///
    /// Returns `false` if there was no such session.
    pub fn disconnect(&self, identity: &ChannelIdentity) -> bool {
        self.0.registry.evict(identity)
    }

    /// Sends the provided `text` over the connected session of the provided
    /// [`ChannelIdentity`].
    ///
    /// Returns the sent [`ChannelMessage`], which is also appended to the
    /// channel history.
    pub fn send_text<T: Into<String>>(
        &self,
        identity: &ChannelIdentity,
        text: T,
    ) -> Option<ChannelMessage> {
        let message = self.0.outgoing(identity, MessageKind::Text, text);
        self.0
            .session(identity)
            .and_then(|s| s.send_message(&message))
            .map_err(|e| log_error("send_text", identity, &e))
            .ok()?;
        Some(self.0.store(message))
    }

    /// Sends the provided [`SystemCommand`] to the remote endpoint of the
    /// provided [`ChannelIdentity`].
    ///
    /// Uses the data channel if the session is connected, or the signalling
    /// relay otherwise (if enabled in [`conf::Signalling`]).
    pub fn send_system_command(
        &self,
        identity: &ChannelIdentity,
        command: SystemCommand,
    ) -> Option<ChannelMessage> {
        let mut message =
            ChannelMessage::system_command(identity.clone(), command);
        message.user_name = self.0.user_name(identity);

        let session = self.0.registry.get(identity.name());
        let result: Result<(), Traced<SessionError>> = match session {
            Some(session) if session.is_data_channel_open() => {
                session.send_message(&message)
            }
            _ if self.0.conf.send_system_commands_via_relay => self
                .0
                .signalling
                .send(&SignallingEnvelope::new(
                    identity.clone(),
                    Signal::SystemCommand { command },
                ))
                .map_err(tracerr::map_from_and_wrap!()),
            session => Err(tracerr::new!(SessionError::from(
                StateError::NotConnected(
                    session.map_or(SessionPhase::Idle, |s| s.phase()),
                )
            ))),
        };
        result
            .map_err(|e| log_error("send_system_command", identity, &e))
            .ok()?;
        Some(self.0.store(message))
    }

    /// Finishes the current video capture and sends it as a chunked transfer.
    pub async fn send_video(
        &self,
        identity: &ChannelIdentity,
    ) -> Option<ChannelMessage> {
        self.send_media(identity, MessageKind::Video).await
    }

    /// Finishes the current audio capture and sends it as a chunked transfer.
    pub async fn send_audio(
        &self,
        identity: &ChannelIdentity,
    ) -> Option<ChannelMessage> {
        self.send_media(identity, MessageKind::Audio).await
    }

    async fn send_media(
        &self,
        identity: &ChannelIdentity,
        kind: MessageKind,
    ) -> Option<ChannelMessage> {
        let session = self
            .0
            .session(identity)
            .map_err(|e| log_error("send_media", identity, &e))
            .ok()?;
        if !session.is_data_channel_open() {
            log::error!(
                "Media can't be sent to `{}`: {}",
                identity,
                StateError::NotConnected(session.phase()),
            );
            return None;
        }

        let bytes = self
            .0
            .recorder
            .finish(kind)
            .await
            .map_err(tracerr::map_from_and_wrap!(=> SessionError))
            .map_err(|e| log_error("send_media", identity, &e))
            .ok()?;
        let trailer = session
            .send_media(kind, &bytes)
            .map_err(|e| log_error("send_media", identity, &e))
            .ok()?;
        let reference = self.0.blobs.store(kind, bytes);

        let message =
            self.0.outgoing(identity, kind, reference).with_transfer(trailer);
        Some(self.0.store(message))
    }

    /// Attaches the provided [`LocalMediaStream`] to the stream sub-channel
    /// of the provided [`ChannelIdentity`], negotiating it if needed, and
    /// notifies the remote endpoint with
    /// [`SystemCommand::CallConnectionStarted`] over the data channel of the
    /// same endpoints (if connected).
    ///
    /// Returns `false` if the `identity` is not a stream one or the stream
    /// couldn't be attached.
    pub async fn start_streaming(
        &self,
        identity: &ChannelIdentity,
        stream: Rc<dyn LocalMediaStream>,
    ) -> bool {
        if !identity.is_stream() {
            log::error!(
                "Streaming can't be started: {}",
                ConfigurationError::NotAStream(identity.name().to_owned()),
            );
            return false;
        }

        let session = self.0.bind(identity);
        let result = if session.phase() == SessionPhase::Idle {
            session.start_call(Some(stream)).await
        } else {
            session.attach_local_stream(stream)
        };
        if let Err(e) = result {
            log_error("start_streaming", identity, &e);
            return false;
        }

        self.notify_data_channel(
            identity,
            SystemCommand::CallConnectionStarted,
        );
        true
    }

    /// Stops local media of the stream sub-channel of the provided
    /// [`ChannelIdentity`], closes its session and notifies the remote
    /// endpoint with [`SystemCommand::CallConnectionStopped`] over the data
    /// channel of the same endpoints (if connected).
    ///
    /// Returns `false` if there was no such stream session.
    pub fn stop_streaming(&self, identity: &ChannelIdentity) -> bool {
        if !identity.is_stream() {
            log::error!(
                "Streaming can't be stopped: {}",
                ConfigurationError::NotAStream(identity.name().to_owned()),
            );
            return false;
        }
        let was_streaming = self.0.registry.evict(identity);
        self.notify_data_channel(
            identity,
            SystemCommand::CallConnectionStopped,
        );
        was_streaming
    }

    /// Sends the provided [`SystemCommand`] over the connected data channel
    /// of the endpoints of the provided stream [`ChannelIdentity`].
    fn notify_data_channel(
        &self,
        identity: &ChannelIdentity,
        command: SystemCommand,
    ) {
        let data_identity = identity.data_identity();
        let is_connected = self
            .0
            .registry
            .get(data_identity.name())
            .map_or(false, |s| s.is_data_channel_open());
        if is_connected {
            drop(self.send_system_command(&data_identity, command));
        }
    }

    /// Returns history of the channel with the provided
    /// [`ChannelIdentity::name()`].
    #[must_use]
    pub fn messages(&self, name: &str) -> Vec<ChannelMessage> {
        self.0
            .messages
            .borrow_mut()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Returns [`SessionPhase`] of the session of the provided
    /// [`ChannelIdentity`], if any.
    #[must_use]
    pub fn phase(&self, identity: &ChannelIdentity) -> Option<SessionPhase> {
        self.0.registry.get(identity.name()).map(|s| s.phase())
    }

    /// Returns [`CallSession`] of the provided [`ChannelIdentity`], if any.
    #[inline]
    #[must_use]
    pub fn session(&self, identity: &ChannelIdentity) -> Option<CallSession> {
        self.0.registry.get(identity.name())
    }

    /// Sets callback invoked with every received text or media
    /// [`ChannelMessage`].
    pub fn on_message<F: Fn(ChannelMessage) + 'static>(&self, f: F) {
        self.0.on_message.set_func(f);
    }

    /// Sets callback invoked with every received [`SystemCommand`].
    pub fn on_system_command<F>(&self, f: F)
    where
        F: Fn((ChannelMessage, SystemCommand)) + 'static,
    {
        self.0.on_system_command.set_func(f);
    }

    /// Sets callback invoked with every remote media track.
    pub fn on_remote_stream<F: Fn(RemoteTrack) + 'static>(&self, f: F) {
        self.0.on_remote_stream.set_func(f);
    }

    /// Closes all the sessions and stops processing events.
    pub fn dispose(&self) {
        log::debug!("Disposing message router");
        drop(self.0.task.borrow_mut().take());
        self.0.bindings.borrow_mut().clear();
        self.0.registry.close_all(CloseReason::Local);
    }
}

impl InnerRouter {
    /// Returns the registered [`CallSession`] of the provided identity,
    /// creating and binding it to this router if needed.
    fn bind(&self, identity: &ChannelIdentity) -> CallSession {
        let session = self.registry.get_or_create(identity);
        let is_bound = self
            .bindings
            .borrow()
            .get(identity.name())
            .map_or(false, |bound| bound.points_to(&session));
        if is_bound {
            return session;
        }

        let mut events = session.subscribe();
        let tx = self.session_events.clone();
        let forward = async move {
            while let Some(event) = events.next().await {
                if tx.unbounded_send(event).is_err() {
                    break;
                }
            }
        };
        if let Err(e) = self.spawner.spawn_local(forward) {
            log::error!("Failed to bind `{}` session: {}", identity, e);
        }
        drop(
            self.bindings
                .borrow_mut()
                .insert(identity.name().to_owned(), session.downgrade()),
        );
        session
    }

    /// Returns the registered [`CallSession`] of the provided identity.
    fn session(
        &self,
        identity: &ChannelIdentity,
    ) -> Result<CallSession, Traced<SessionError>> {
        self.registry.get(identity.name()).ok_or_else(|| {
            tracerr::new!(SessionError::from(StateError::NoSession(
                identity.name().to_owned()
            )))
        })
    }

    /// Dispatches an envelope received from the signalling relay.
    fn handle_envelope(&self, envelope: SignallingEnvelope) {
        let (label, signal) = match envelope.into_parts() {
            Ok(parts) => parts,
            Err(e) => {
                log::warn!("Dropping malformed signalling envelope: {}", e);
                return;
            }
        };
        // Envelopes are labeled from the sender's point of view.
        let identity = label.reversed();

        match signal {
            Signal::Offer { .. } => self.bind(&identity).handle_signal(signal),
            Signal::SystemCommand { command }
                if self.registry.get(identity.name()).is_none() =>
            {
                let message = ChannelMessage::incoming(
                    identity,
                    MessageKind::SystemCommand,
                    command.to_string(),
                );
                self.on_system_command_received(message, command);
            }
            signal => match self.registry.get(identity.name()) {
                Some(session) => session.handle_signal(signal),
                None => log::warn!(
                    "Dropping `{:?}` signal: {}",
                    signal.kind(),
                    StateError::NoSession(identity.name().to_owned()),
                ),
            },
        }
    }

    /// Creates an outgoing [`ChannelMessage`] signed with the local user
    /// name.
    fn outgoing<P: Into<String>>(
        &self,
        identity: &ChannelIdentity,
        kind: MessageKind,
        payload: P,
    ) -> ChannelMessage {
        let mut message =
            ChannelMessage::outgoing(identity.clone(), kind, payload);
        message.user_name = self.user_name(identity);
        message
    }

    /// Returns name of the local user of the provided identity.
    fn user_name(&self, identity: &ChannelIdentity) -> Option<String> {
        identity.from().map(|c| c.name.clone()).filter(|n| !n.is_empty())
    }

    /// Appends the provided [`ChannelMessage`] to its channel history.
    fn store(&self, message: ChannelMessage) -> ChannelMessage {
        self.messages
            .borrow_mut()
            .entry(message.identity.name().to_owned())
            .or_default()
            .push(message.clone());
        message
    }
}

/// Handlers of the events of bound [`CallSession`]s.
impl SessionEventHandler for InnerRouter {
    type Output = ();

    fn on_message_received(&self, message: ChannelMessage) {
        self.on_message.call1(self.store(message));
    }

    /// Stops the remote streams of the endpoints on
    /// [`SystemCommand::CallConnectionStopped`] before notifying the
    /// application.
    fn on_system_command_received(
        &self,
        message: ChannelMessage,
        command: SystemCommand,
    ) {
        if command == SystemCommand::CallConnectionStopped
            && !message.identity.is_stream()
        {
            for session in self.registry.stream_sessions(&message.identity) {
                session.close(CloseReason::RemoteBye);
            }
        }
        self.on_system_command.call1((self.store(message), command));
    }

    fn on_remote_track_added(&self, track: RemoteTrack) {
        self.on_remote_stream.call1(track);
    }

    fn on_closed(&self, identity: ChannelIdentity, reason: CloseReason) {
        log::debug!("Session `{}` closed: {}", identity, reason);
        let mut bindings = self.bindings.borrow_mut();
        let is_stale = bindings
            .get(identity.name())
            .and_then(WeakCallSession::upgrade)
            .map_or(true, |s| s.phase() == SessionPhase::Closed);
        if is_stale {
            drop(bindings.remove(identity.name()));
        }
    }
}

/// Logs the provided error of a façade operation.
fn log_error(
    operation: &str,
    identity: &ChannelIdentity,
    err: &Traced<SessionError>,
) {
    log::error!(
        "`{}` of `{}` failed: {}\n{}",
        operation,
        identity,
        err,
        err.trace(),
    );
}

impl Drop for InnerRouter {
    fn drop(&mut self) {
        self.registry.close_all(CloseReason::Local);
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use futures::{executor::LocalPool, stream};
    use peerlink_signalling_proto::{
        Channel, ChannelIdentity, Direction, IceCandidate, Signal, SignalKind,
        SignallingEnvelope, SystemCommand,
    };

    use crate::{
        conf::Conf,
        loopback::{InMemoryBlobStorage, LoopbackNetwork, LoopbackRecorder},
        platform::{MockSignallingClient, TransportError},
    };

    use super::MessageRouter;

    fn identity() -> ChannelIdentity {
        ChannelIdentity::p2p(
            "1",
            Channel::user("1", "alice"),
            Channel::user("2", "bob"),
        )
        .unwrap()
    }

    fn router(
        pool: &LocalPool,
        signalling: MockSignallingClient,
    ) -> MessageRouter {
        MessageRouter::new(
            &Conf::default(),
            Rc::new(signalling),
            Rc::new(LoopbackNetwork::new().endpoint()),
            Rc::new(LoopbackRecorder::default()),
            Rc::new(InMemoryBlobStorage::default()),
            Rc::new(pool.spawner()),
        )
    }

    #[test]
    fn relay_failure_is_not_recorded() {
        let pool = LocalPool::new();
        let mut signalling = MockSignallingClient::new();
        signalling
            .expect_subscribe()
            .times(1)
            .returning(|| Box::pin(stream::pending()));
        signalling
            .expect_on_connection_loss()
            .times(1)
            .returning(|| Box::pin(stream::pending()));
        signalling.expect_send().times(1).returning(|_| {
            Err(tracerr::new!(TransportError::SendSignal(
                "relay is down".to_owned()
            )))
        });
        let router = router(&pool, signalling);

        assert!(router
            .send_system_command(&identity(), SystemCommand::CallBusy)
            .is_none());
        assert!(router.messages(identity().name()).is_empty());
    }

    #[test]
    fn malformed_envelope_is_skipped() {
        let mut pool = LocalPool::new();
        let remote = identity().reversed();
        let envelopes = vec![
            SignallingEnvelope {
                kind: SignalKind::SystemCommand,
                data_channel_label: remote.clone(),
                data: Default::default(),
            },
            SignallingEnvelope::new(
                remote,
                Signal::SystemCommand {
                    command: SystemCommand::CallTimeout,
                },
            ),
        ];
        let mut signalling = MockSignallingClient::new();
        signalling
            .expect_subscribe()
            .times(1)
            .return_once(move || Box::pin(stream::iter(envelopes)));
        signalling
            .expect_on_connection_loss()
            .times(1)
            .returning(|| Box::pin(stream::pending()));
        let router = router(&pool, signalling);
        let commands = Rc::new(RefCell::new(Vec::new()));
        let commands_clone = Rc::clone(&commands);
        router.on_system_command(move |(_, command)| {
            commands_clone.borrow_mut().push(command)
        });

        pool.run_until_stalled();

        assert_eq!(*commands.borrow(), vec![SystemCommand::CallTimeout]);
        let history = router.messages(identity().name());
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].direction, Direction::In);
        assert_eq!(history[0].payload, "call-timeout");
        assert_eq!(router.phase(&identity()), None);
    }

    #[test]
    fn candidate_without_session_is_dropped() {
        let mut pool = LocalPool::new();
        let envelope = SignallingEnvelope::new(
            identity().reversed(),
            Signal::Candidate {
                candidate: IceCandidate {
                    candidate: "candidate:2 1 udp 1 127.0.0.1 9 typ host"
                        .to_owned(),
                    sdp_m_line_index: Some(0),
                    sdp_mid: None,
                },
            },
        );
        let mut signalling = MockSignallingClient::new();
        signalling
            .expect_subscribe()
            .times(1)
            .return_once(move || Box::pin(stream::iter(vec![envelope])));
        signalling
            .expect_on_connection_loss()
            .times(1)
            .returning(|| Box::pin(stream::pending()));
        let router = router(&pool, signalling);

        pool.run_until_stalled();

        assert_eq!(router.phase(&identity()), None);
        assert!(router.messages(identity().name()).is_empty());
    }
}
