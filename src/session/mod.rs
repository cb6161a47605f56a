//! Signalling state machine of a single [`ChannelIdentity`].

pub mod transfer;

use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use derive_more::{Display, From};
use futures::{
    channel::{mpsc, oneshot},
    future::{FutureExt as _, LocalBoxFuture},
    stream::LocalBoxStream,
    task::{LocalSpawn, LocalSpawnExt as _},
    Future, StreamExt as _,
};
use medea_macro::dispatchable;
use medea_reactive::ObservableCell;
use peerlink_signalling_proto::{
    ChannelIdentity, ChannelMessage, IceCandidate, MessageKind, ParseError,
    Signal, SignalHandler, SignalKind, SignallingEnvelope, SystemCommand,
    TransferTrailer,
};
use tracerr::Traced;

use crate::{
    conf,
    platform::{
        BlobStorage, DataChannel, DataChannelPayload, LocalMediaStream,
        PeerTransport, PeerTransportEvent, PeerTransportEventHandler,
        PeerTransportFactory, RemoteTrack, SdpType, SignallingClient,
        TransportError,
    },
};

use self::transfer::{Chunk, Reassembler};

/// Phase of a [`CallSession`].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum SessionPhase {
    /// Nothing has been negotiated yet.
    Idle,

    /// SDP offer/answer exchange is in progress.
    Negotiating,

    /// Both descriptions are applied, waiting for the `ready` handshake.
    AwaitingPeerReady,

    /// Both endpoints are ready, data channel traffic may flow.
    Connected,

    /// Session is being torn down.
    Closing,

    /// Session is torn down and can't be used anymore.
    Closed,
}

/// Side of the SDP negotiation a [`CallSession`] plays.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum NegotiationRole {
    /// Session has created the SDP offer.
    Offerer,

    /// Session has answered the SDP offer of the remote endpoint.
    Answerer,
}

/// Reason of a [`CallSession`] closing.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum CloseReason {
    /// Closed by the local endpoint.
    Local,

    /// Remote endpoint has sent `bye`.
    RemoteBye,

    /// Peer transport has been closed.
    TransportClosed,

    /// Connection to the signalling relay has been lost.
    SignallingLost,

    /// Peer transport rejected the SDP negotiation.
    NegotiationFailed,
}

impl CloseReason {
    /// Indicates whether the remote endpoint should be notified with `bye`.
    #[inline]
    #[must_use]
    pub fn notifies_peer(self) -> bool {
        matches!(self, Self::Local | Self::NegotiationFailed)
    }
}

/// Operation is not applicable to the current state of a [`CallSession`].
#[derive(Clone, Debug, Display, Eq, PartialEq)]
pub enum StateError {
    /// Signal doesn't fit the current [`SessionPhase`].
    #[display(fmt = "Unexpected `{:?}` signal in {} phase", _0, _1)]
    UnexpectedSignal(SignalKind, SessionPhase),

    /// Call can be started only from [`SessionPhase::Idle`].
    #[display(fmt = "Call can't be started in {} phase", _0)]
    AlreadyStarted(SessionPhase),

    /// Data traffic requires [`SessionPhase::Connected`].
    #[display(fmt = "Session is not connected, it's in {} phase", _0)]
    NotConnected(SessionPhase),

    /// Session is connected, but has no open [`DataChannel`].
    #[display(fmt = "Session has no open data channel")]
    NoDataChannel,

    /// Only audio and video can be sent as chunked transfers.
    #[display(fmt = "`{:?}` messages can't be sent as chunked transfers", _0)]
    NotMedia(MessageKind),

    /// Session has been closed.
    #[display(fmt = "Session is closed")]
    Closed,

    /// No session is registered for the addressed channel.
    #[display(fmt = "No session for `{}`", _0)]
    NoSession(String),
}

/// Errors of [`CallSession`] operations.
#[derive(Clone, Debug, Display, From)]
pub enum SessionError {
    /// External collaborator failed.
    #[display(fmt = "{}", _0)]
    Transport(TransportError),

    /// Received payload couldn't be decoded.
    #[display(fmt = "{}", _0)]
    Parse(ParseError),

    /// Operation doesn't fit the session state.
    #[display(fmt = "{}", _0)]
    State(StateError),
}

/// Collaborators shared by all the [`CallSession`]s of one endpoint.
#[derive(Clone)]
pub struct SessionContext {
    /// Client of the signalling relay.
    pub signalling: Rc<dyn SignallingClient>,

    /// Factory of [`PeerTransport`]s.
    pub transports: Rc<dyn PeerTransportFactory>,

    /// Storage for reassembled media blobs.
    pub blobs: Rc<dyn BlobStorage>,

    /// Spawner of the session tasks.
    pub spawner: Rc<dyn LocalSpawn>,

    /// Chunked transfer settings.
    pub transfer: conf::Transfer,
}

/// Events a [`CallSession`] reports to its subscribers.
#[dispatchable(self: &Self)]
#[derive(Clone, Debug)]
pub enum SessionEvent {
    /// Text or reassembled media message has been received.
    MessageReceived {
        /// Received message, normalized to the local endpoint.
        message: ChannelMessage,
    },

    /// [`SystemCommand`] not consumed by the transfer protocol has been
    /// received.
    SystemCommandReceived {
        /// Received message, normalized to the local endpoint.
        message: ChannelMessage,

        /// Parsed token of the `message`.
        command: SystemCommand,
    },

    /// Remote endpoint added a media track.
    RemoteTrackAdded {
        /// Added [`RemoteTrack`].
        track: RemoteTrack,
    },

    /// Session has been closed.
    Closed {
        /// [`ChannelIdentity`] of the closed session.
        identity: ChannelIdentity,

        /// Reason of the closing.
        reason: CloseReason,
    },
}

/// Commands processed sequentially by the task of a [`CallSession`].
enum Command {
    /// Start negotiation as the offering side.
    StartCall(
        Option<Rc<dyn LocalMediaStream>>,
        oneshot::Sender<Result<(), Traced<SessionError>>>,
    ),

    /// Signal received from the remote endpoint.
    Signal(Signal),

    /// Event of the owned [`PeerTransport`].
    Transport(PeerTransportEvent),
}

/// Signalling and data session of one [`ChannelIdentity`].
///
/// Owns one [`PeerTransport`] and its [`DataChannel`]. All the signals,
/// transport events and call requests are processed one by one by a single
/// task, so negotiation steps never interleave.
#[derive(Clone)]
pub struct CallSession(Rc<InnerSession>);

/// Weak reference to a [`CallSession`].
#[derive(Clone)]
pub struct WeakCallSession(Weak<InnerSession>);

impl WeakCallSession {
    /// Upgrades this reference, if the [`CallSession`] is still alive.
    #[inline]
    #[must_use]
    pub fn upgrade(&self) -> Option<CallSession> {
        self.0.upgrade().map(CallSession)
    }

    /// Indicates whether this reference points to the provided
    /// [`CallSession`].
    #[inline]
    #[must_use]
    pub fn points_to(&self, session: &CallSession) -> bool {
        std::ptr::eq(self.0.as_ptr(), Rc::as_ptr(&session.0))
    }
}

struct InnerSession {
    /// [`ChannelIdentity`] as seen by the local endpoint.
    identity: ChannelIdentity,

    /// Shared collaborators.
    ctx: SessionContext,

    /// Current [`SessionPhase`].
    phase: ObservableCell<SessionPhase>,

    /// Negotiation side, once known.
    role: Cell<Option<NegotiationRole>>,

    /// Reason of closing, once closed.
    close_reason: Cell<Option<CloseReason>>,

    /// Owned [`PeerTransport`], once created.
    transport: RefCell<Option<Rc<dyn PeerTransport>>>,

    /// Created or announced [`DataChannel`].
    data_channel: RefCell<Option<Rc<dyn DataChannel>>>,

    /// Local media attached to this session.
    local_stream: RefCell<Option<Rc<dyn LocalMediaStream>>>,

    /// Whether the remote description has been applied.
    has_remote_description: Cell<bool>,

    /// Remote candidates received before the remote description.
    pending_candidates: RefCell<Vec<IceCandidate>>,

    /// Whether at least one remote candidate has been applied.
    processed_candidate: Cell<bool>,

    /// Whether `ready` has been sent.
    ready_sent: Cell<bool>,

    /// Whether `ready` has been received.
    peer_ready: Cell<bool>,

    /// ID of the next outgoing transfer.
    next_transfer_id: Cell<u32>,

    /// Incoming transfers awaiting their trailers.
    transfers: RefCell<Reassembler>,

    /// Inbox of the session task.
    inbox: mpsc::UnboundedSender<Command>,

    /// Subscribers to [`SessionEvent`]s.
    subscribers: RefCell<Vec<mpsc::UnboundedSender<SessionEvent>>>,

    /// Invoked once the session is closed.
    on_close: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl CallSession {
    /// Creates a new [`SessionPhase::Idle`] [`CallSession`] for the provided
    /// local [`ChannelIdentity`] and spawns its task.
    #[must_use]
    pub fn new(identity: ChannelIdentity, ctx: SessionContext) -> Self {
        let (inbox, mut commands) = mpsc::unbounded();
        let inner = Rc::new(InnerSession {
            identity,
            ctx,
            phase: ObservableCell::new(SessionPhase::Idle),
            role: Cell::new(None),
            close_reason: Cell::new(None),
            transport: RefCell::new(None),
            data_channel: RefCell::new(None),
            local_stream: RefCell::new(None),
            has_remote_description: Cell::new(false),
            pending_candidates: RefCell::default(),
            processed_candidate: Cell::new(false),
            ready_sent: Cell::new(false),
            peer_ready: Cell::new(false),
            next_transfer_id: Cell::new(0),
            transfers: RefCell::default(),
            inbox,
            subscribers: RefCell::default(),
            on_close: RefCell::new(None),
        });

        let weak_inner = Rc::downgrade(&inner);
        inner.spawn(async move {
            while let Some(command) = commands.next().await {
                if let Some(inner) = weak_inner.upgrade() {
                    inner.handle(command).await;
                } else {
                    break;
                }
            }
        });

        Self(inner)
    }

    /// Returns the local [`ChannelIdentity`] of this [`CallSession`].
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &ChannelIdentity {
        &self.0.identity
    }

    /// Returns the current [`SessionPhase`].
    #[inline]
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.0.phase.get()
    }

    /// Returns [`LocalBoxStream`] of [`SessionPhase`] changes, starting with
    /// the current one.
    #[inline]
    pub fn on_phase_change(&self) -> LocalBoxStream<'static, SessionPhase> {
        self.0.phase.subscribe()
    }

    /// Returns [`Future`] resolving once this session reaches the provided
    /// [`SessionPhase`].
    ///
    /// Resolves to `false` if the session is dropped before that.
    pub fn when_phase(
        &self,
        phase: SessionPhase,
    ) -> LocalBoxFuture<'static, bool> {
        self.0.phase.when_eq(phase).map(|res| res.is_ok()).boxed_local()
    }

    /// Returns [`NegotiationRole`] of this session, once negotiation started.
    #[inline]
    #[must_use]
    pub fn role(&self) -> Option<NegotiationRole> {
        self.0.role.get()
    }

    /// Returns [`CloseReason`] of this session, if it's closed.
    #[inline]
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.0.close_reason.get()
    }

    /// Indicates whether data can be sent over this session right now.
    #[must_use]
    pub fn is_data_channel_open(&self) -> bool {
        self.0.connected_channel().is_ok()
    }

    /// Returns number of incoming transfers awaiting their trailers.
    #[inline]
    #[must_use]
    pub fn pending_transfers(&self) -> usize {
        self.0.transfers.borrow().pending()
    }

    /// Starts negotiation as the offering side: creates a [`PeerTransport`],
    /// attaches the provided local media, creates a [`DataChannel`] (for
    /// non-stream identities) and sends an SDP offer.
    ///
    /// Resolves once the offer is sent. Negotiation failure closes this
    /// session with [`CloseReason::NegotiationFailed`].
    ///
    /// # Errors
    ///
    /// - [`StateError::AlreadyStarted`] if this session is not
    ///   [`SessionPhase::Idle`].
    /// - [`StateError::Closed`] if this session is closed.
    /// - [`SessionError::Transport`] if any negotiation step fails.
    pub fn start_call(
        &self,
        stream: Option<Rc<dyn LocalMediaStream>>,
    ) -> impl Future<Output = Result<(), Traced<SessionError>>> {
        let (tx, rx) = oneshot::channel();
        let queued = self
            .0
            .inbox
            .unbounded_send(Command::StartCall(stream, tx))
            .is_ok();
        async move {
            if !queued {
                return Err(tracerr::new!(SessionError::from(
                    StateError::Closed
                )));
            }
            rx.await.unwrap_or_else(|_| {
                Err(tracerr::new!(SessionError::from(StateError::Closed)))
            })
        }
    }

    /// Queues the provided [`Signal`] received from the remote endpoint.
    pub fn handle_signal(&self, signal: Signal) {
        if self.0.inbox.unbounded_send(Command::Signal(signal)).is_err() {
            log::debug!(
                "Signal to closed session `{}` is ignored",
                self.0.identity,
            );
        }
    }

    /// Attaches the provided [`LocalMediaStream`] to this session, replacing
    /// the previous one.
    ///
    /// The stream is stopped when this session closes.
    ///
    /// # Errors
    ///
    /// - [`StateError::Closed`] if this session is closed.
    /// - [`SessionError::Transport`] if the [`PeerTransport`] rejects it.
    pub fn attach_local_stream(
        &self,
        stream: Rc<dyn LocalMediaStream>,
    ) -> Result<(), Traced<SessionError>> {
        self.0.ensure_open()?;
        self.0.attach_local_stream(stream)
    }

    /// Sends the provided [`ChannelMessage`] over the open [`DataChannel`].
    ///
    /// # Errors
    ///
    /// - [`StateError::NotConnected`] if this session is not
    ///   [`SessionPhase::Connected`].
    /// - [`StateError::NoDataChannel`] if there is no open [`DataChannel`].
    /// - [`SessionError::Transport`] if sending fails.
    pub fn send_message(
        &self,
        message: &ChannelMessage,
    ) -> Result<(), Traced<SessionError>> {
        let frame = message.to_json().map_err(tracerr::from_and_wrap!())?;
        self.0
            .connected_channel()?
            .send(DataChannelPayload::Text(frame))
            .map_err(tracerr::map_from_and_wrap!())
    }

    /// Sends the provided media `payload` as a chunked transfer followed by
    /// its trailer.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotMedia`] if `kind` is neither audio nor video.
    /// - Any error of [`CallSession::send_message()`].
    pub fn send_media(
        &self,
        kind: MessageKind,
        payload: &Bytes,
    ) -> Result<TransferTrailer, Traced<SessionError>> {
        let trailer_command = SystemCommand::trailer_for(kind).ok_or_else(
            || tracerr::new!(SessionError::from(StateError::NotMedia(kind))),
        )?;
        let channel = self.0.connected_channel()?;

        let id = self.0.next_transfer_id.get();
        self.0.next_transfer_id.set(id.wrapping_add(1));
        let (frames, trailer) = transfer::split(
            id,
            payload,
            self.0.ctx.transfer.chunk_size(),
        );
        for frame in frames {
            channel
                .send(DataChannelPayload::Binary(frame))
                .map_err(tracerr::map_from_and_wrap!())?;
        }

        let message = ChannelMessage::system_command(
            self.0.identity.clone(),
            trailer_command,
        )
        .with_transfer(trailer);
        self.send_message(&message)?;

        Ok(trailer)
    }

    /// Returns [`LocalBoxStream`] of [`SessionEvent`]s of this session.
    ///
    /// The stream ends once this session is closed.
    pub fn subscribe(&self) -> LocalBoxStream<'static, SessionEvent> {
        let (tx, rx) = mpsc::unbounded();
        if self.phase() == SessionPhase::Closed {
            tx.close_channel();
        } else {
            self.0.subscribers.borrow_mut().push(tx);
        }
        Box::pin(rx)
    }

    /// Closes this session: notifies the remote endpoint (if `reason`
    /// requires so), closes the [`DataChannel`] and the [`PeerTransport`],
    /// stops local media and discards incomplete transfers.
    ///
    /// Idempotent: closing a closed session is a no-op.
    #[inline]
    pub fn close(&self, reason: CloseReason) {
        self.0.close(reason);
    }

    /// Sets the function invoked once this session is closed.
    pub(crate) fn on_close<F: FnOnce() + 'static>(&self, f: F) {
        self.0.on_close.borrow_mut().replace(Box::new(f));
    }

    /// Returns [`WeakCallSession`] reference to this session.
    #[inline]
    #[must_use]
    pub fn downgrade(&self) -> WeakCallSession {
        WeakCallSession(Rc::downgrade(&self.0))
    }

    /// Indicates whether both handles point to the same session.
    #[inline]
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl InnerSession {
    /// Spawns the provided task on the session spawner.
    fn spawn<F: Future<Output = ()> + 'static>(&self, task: F) {
        if let Err(e) = self.ctx.spawner.spawn_local(task) {
            log::error!("Failed to spawn `{}` task: {}", self.identity, e);
        }
    }

    /// Processes one [`Command`] of the session task.
    async fn handle(&self, command: Command) {
        if self.phase.get() == SessionPhase::Closed {
            if let Command::StartCall(_, tx) = command {
                let _ = tx.send(Err(tracerr::new!(SessionError::from(
                    StateError::Closed
                ))));
            }
            return;
        }

        let result = match command {
            Command::StartCall(stream, tx) => {
                let result = self.start_call(stream).await;
                self.close_on_negotiation_failure(&result);
                let _ = tx.send(result);
                return;
            }
            Command::Signal(signal) => signal.dispatch_with(self).await,
            Command::Transport(event) => event.dispatch_with(self).await,
        };
        if let Err(e) = result {
            log::error!(
                "Session `{}` error: {}\n{}",
                self.identity,
                e,
                e.trace(),
            );
        }
    }

    /// Closes this session if the provided negotiation `result` is a
    /// [`TransportError`].
    fn close_on_negotiation_failure(
        &self,
        result: &Result<(), Traced<SessionError>>,
    ) {
        if let Err(e) = result {
            if let SessionError::Transport(_) = e.as_ref() {
                self.close(CloseReason::NegotiationFailed);
            }
        }
    }

    /// Errors with [`StateError::Closed`] if this session is closing or
    /// closed.
    fn ensure_open(&self) -> Result<(), Traced<SessionError>> {
        match self.phase.get() {
            SessionPhase::Closing | SessionPhase::Closed => {
                Err(tracerr::new!(SessionError::from(StateError::Closed)))
            }
            _ => Ok(()),
        }
    }

    /// Returns the open [`DataChannel`] of a connected session.
    fn connected_channel(
        &self,
    ) -> Result<Rc<dyn DataChannel>, Traced<SessionError>> {
        let phase = self.phase.get();
        if phase != SessionPhase::Connected {
            return Err(tracerr::new!(SessionError::from(
                StateError::NotConnected(phase)
            )));
        }
        self.data_channel
            .borrow()
            .as_ref()
            .filter(|c| c.is_open())
            .map(Rc::clone)
            .ok_or_else(|| {
                tracerr::new!(SessionError::from(StateError::NoDataChannel))
            })
    }

    /// Returns the owned [`PeerTransport`].
    fn transport(
        &self,
    ) -> Result<Rc<dyn PeerTransport>, Traced<SessionError>> {
        self.transport.borrow().as_ref().map(Rc::clone).ok_or_else(|| {
            tracerr::new!(SessionError::from(StateError::NotConnected(
                self.phase.get()
            )))
        })
    }

    /// Creates the [`PeerTransport`] and starts forwarding its events into
    /// the session inbox.
    fn init_transport(
        &self,
    ) -> Result<Rc<dyn PeerTransport>, Traced<SessionError>> {
        let transport = self
            .ctx
            .transports
            .create(&self.identity)
            .map_err(tracerr::map_from_and_wrap!())?;

        let mut events = transport.on_event();
        let inbox = self.inbox.clone();
        self.spawn(async move {
            while let Some(event) = events.next().await {
                if inbox.unbounded_send(Command::Transport(event)).is_err() {
                    break;
                }
            }
        });

        if let Some(stream) = self.local_stream.borrow().as_ref() {
            transport
                .add_local_stream(stream)
                .map_err(tracerr::map_from_and_wrap!())?;
        }
        self.transport.replace(Some(Rc::clone(&transport)));

        Ok(transport)
    }

    /// Stores the provided [`LocalMediaStream`] and attaches it to the
    /// [`PeerTransport`], if any.
    fn attach_local_stream(
        &self,
        stream: Rc<dyn LocalMediaStream>,
    ) -> Result<(), Traced<SessionError>> {
        if let Some(transport) = self.transport.borrow().as_ref() {
            transport
                .add_local_stream(&stream)
                .map_err(tracerr::map_from_and_wrap!())?;
        }
        self.local_stream.replace(Some(stream));
        Ok(())
    }

    /// Sends the provided [`Signal`] to the remote endpoint.
    fn send_signal(&self, signal: Signal) -> Result<(), Traced<SessionError>> {
        self.ctx
            .signalling
            .send(&SignallingEnvelope::new(self.identity.clone(), signal))
            .map_err(tracerr::map_from_and_wrap!())
    }

    /// Notifies all the subscribers with the provided [`SessionEvent`].
    fn emit(&self, event: SessionEvent) {
        self.subscribers
            .borrow_mut()
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    /// Negotiates as the offering side.
    async fn start_call(
        &self,
        stream: Option<Rc<dyn LocalMediaStream>>,
    ) -> Result<(), Traced<SessionError>> {
        let phase = self.phase.get();
        if phase != SessionPhase::Idle {
            return Err(tracerr::new!(SessionError::from(
                StateError::AlreadyStarted(phase)
            )));
        }
        self.role.set(Some(NegotiationRole::Offerer));
        self.phase.set(SessionPhase::Negotiating);

        if let Some(stream) = stream {
            self.local_stream.replace(Some(stream));
        }
        let transport = self.init_transport()?;
        if !self.identity.is_stream() {
            let channel = transport
                .create_data_channel(self.identity.name())
                .map_err(tracerr::map_from_and_wrap!())?;
            self.data_channel.replace(Some(channel));
        }

        let offer = transport
            .create_offer()
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()?;
        self.send_signal(Signal::Offer { sdp: offer.clone() })?;
        transport
            .set_local_description(SdpType::Offer(offer))
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()
    }

    /// Negotiates as the answering side.
    async fn accept_offer(
        &self,
        sdp: String,
    ) -> Result<(), Traced<SessionError>> {
        let phase = self.phase.get();
        if phase != SessionPhase::Idle {
            return Err(tracerr::new!(SessionError::from(
                StateError::UnexpectedSignal(SignalKind::Offer, phase)
            )));
        }
        self.role.set(Some(NegotiationRole::Answerer));
        self.phase.set(SessionPhase::Negotiating);

        let transport = self.init_transport()?;
        transport
            .set_remote_description(SdpType::Offer(sdp))
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()?;
        self.has_remote_description.set(true);
        self.apply_pending_candidates().await;

        let answer = transport
            .create_answer()
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()?;
        self.send_signal(Signal::Answer {
            sdp: answer.clone(),
        })?;
        transport
            .set_local_description(SdpType::Answer(answer))
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()?;

        self.phase.set(SessionPhase::AwaitingPeerReady);
        self.send_ready_if_possible()
    }

    /// Applies the SDP answer of the remote endpoint.
    async fn accept_answer(
        &self,
        sdp: String,
    ) -> Result<(), Traced<SessionError>> {
        let phase = self.phase.get();
        if self.role.get() != Some(NegotiationRole::Offerer)
            || phase != SessionPhase::Negotiating
        {
            return Err(tracerr::new!(SessionError::from(
                StateError::UnexpectedSignal(SignalKind::Answer, phase)
            )));
        }

        self.transport()?
            .set_remote_description(SdpType::Answer(sdp))
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.ensure_open()?;
        self.has_remote_description.set(true);
        self.phase.set(SessionPhase::AwaitingPeerReady);
        self.apply_pending_candidates().await;

        self.send_ready_if_possible()
    }

    /// Applies the provided remote [`IceCandidate`].
    async fn apply_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), Traced<SessionError>> {
        self.transport()?
            .add_ice_candidate(candidate)
            .await
            .map_err(tracerr::map_from_and_wrap!())?;
        self.processed_candidate.set(true);
        Ok(())
    }

    /// Applies all the remote candidates queued before the remote
    /// description.
    async fn apply_pending_candidates(&self) {
        let pending: Vec<_> =
            self.pending_candidates.borrow_mut().drain(..).collect();
        for candidate in pending {
            if let Err(e) = self.apply_candidate(candidate).await {
                log::error!(
                    "Failed to apply queued candidate of `{}`: {}",
                    self.identity,
                    e,
                );
            }
        }
    }

    /// Sends `ready` once both the remote description and at least one
    /// remote candidate are applied.
    fn send_ready_if_possible(&self) -> Result<(), Traced<SessionError>> {
        if !self.ready_sent.get()
            && self.has_remote_description.get()
            && self.processed_candidate.get()
        {
            self.send_signal(Signal::Ready)?;
            self.ready_sent.set(true);
        }
        self.connect_if_ready();
        Ok(())
    }

    /// Switches to [`SessionPhase::Connected`] once `ready` has been both
    /// sent and received.
    fn connect_if_ready(&self) {
        if self.ready_sent.get()
            && self.peer_ready.get()
            && self.phase.get() == SessionPhase::AwaitingPeerReady
        {
            log::debug!("Session `{}` is connected", self.identity);
            self.phase.set(SessionPhase::Connected);
        }
    }

    /// Decodes a text frame received over the [`DataChannel`].
    fn receive_text(&self, frame: &str) -> Result<(), Traced<SessionError>> {
        let message = ChannelMessage::from_json(frame)
            .map_err(tracerr::from_and_wrap!())?
            .normalize_inbound(self.identity.clone());

        let command = match message.system_command_token() {
            None => {
                self.emit(SessionEvent::MessageReceived { message });
                return Ok(());
            }
            Some(token) => token.map_err(tracerr::from_and_wrap!())?,
        };

        if let Some(kind) = command.transfer_kind() {
            let trailer = message.transfer.ok_or_else(|| {
                tracerr::new!(SessionError::from(ParseError::MissingTrailer(
                    command
                )))
            })?;
            let blob = self
                .transfers
                .borrow_mut()
                .finish(&trailer)
                .map_err(tracerr::from_and_wrap!())?;
            let reference = self.ctx.blobs.store(kind, blob);

            let mut media =
                ChannelMessage::incoming(self.identity.clone(), kind, reference)
                    .with_transfer(trailer);
            media.user_name = message.user_name;
            self.emit(SessionEvent::MessageReceived { message: media });
        } else {
            self.emit(SessionEvent::SystemCommandReceived { message, command });
        }
        Ok(())
    }

    /// Tears this session down. No-op if it's closing or closed already.
    fn close(&self, reason: CloseReason) {
        if self.ensure_open().is_err() {
            return;
        }
        log::debug!("Closing session `{}`: {}", self.identity, reason);
        self.phase.set(SessionPhase::Closing);

        let transport = self.transport.borrow_mut().take();
        if transport.is_some() && reason.notifies_peer() {
            if let Err(e) = self.send_signal(Signal::Bye) {
                log::warn!(
                    "Failed to send bye for `{}`: {}",
                    self.identity,
                    e,
                );
            }
        }
        if let Some(channel) = self.data_channel.borrow_mut().take() {
            channel.close();
        }
        if let Some(transport) = transport {
            transport.close();
        }
        if let Some(stream) = self.local_stream.borrow_mut().take() {
            stream.stop();
        }
        self.transfers.borrow_mut().clear();
        self.pending_candidates.borrow_mut().clear();

        self.close_reason.set(Some(reason));
        self.phase.set(SessionPhase::Closed);
        self.inbox.close_channel();

        self.emit(SessionEvent::Closed {
            identity: self.identity.clone(),
            reason,
        });
        self.subscribers.borrow_mut().clear();

        let on_close = self.on_close.borrow_mut().take();
        if let Some(f) = on_close {
            f();
        }
    }
}

/// Signals of the remote endpoint handling.
#[async_trait(?Send)]
impl SignalHandler for InnerSession {
    type Output = Result<(), Traced<SessionError>>;

    /// Answers the SDP offer, closing this session if negotiation fails.
    async fn on_offer(&self, sdp: String) -> Self::Output {
        let result = self.accept_offer(sdp).await;
        self.close_on_negotiation_failure(&result);
        result
    }

    /// Applies the SDP answer, closing this session if negotiation fails.
    async fn on_answer(&self, sdp: String) -> Self::Output {
        let result = self.accept_answer(sdp).await;
        self.close_on_negotiation_failure(&result);
        result
    }

    /// Applies the remote [`IceCandidate`], or queues it until the remote
    /// description is applied.
    async fn on_candidate(&self, candidate: IceCandidate) -> Self::Output {
        if !self.has_remote_description.get() {
            self.pending_candidates.borrow_mut().push(candidate);
            return Ok(());
        }
        self.apply_candidate(candidate).await?;
        self.send_ready_if_possible()
    }

    async fn on_ready(&self) -> Self::Output {
        self.peer_ready.set(true);
        self.connect_if_ready();
        Ok(())
    }

    async fn on_bye(&self) -> Self::Output {
        self.close(CloseReason::RemoteBye);
        Ok(())
    }

    /// Delivers the relayed [`SystemCommand`] as if it was received over the
    /// [`DataChannel`].
    async fn on_system_command(&self, command: SystemCommand) -> Self::Output {
        let message = ChannelMessage::incoming(
            self.identity.clone(),
            MessageKind::SystemCommand,
            command.to_string(),
        );
        self.emit(SessionEvent::SystemCommandReceived { message, command });
        Ok(())
    }
}

/// Events of the owned [`PeerTransport`] handling.
#[async_trait(?Send)]
impl PeerTransportEventHandler for InnerSession {
    type Output = Result<(), Traced<SessionError>>;

    /// Sends the discovered [`IceCandidate`] to the remote endpoint.
    async fn on_ice_candidate_discovered(
        &self,
        candidate: IceCandidate,
    ) -> Self::Output {
        self.send_signal(Signal::Candidate { candidate })
    }

    async fn on_data_channel_opened(
        &self,
        channel: Rc<dyn DataChannel>,
    ) -> Self::Output {
        log::debug!(
            "Data channel `{}` of `{}` is open",
            channel.label(),
            self.identity,
        );
        self.data_channel.replace(Some(channel));
        Ok(())
    }

    async fn on_data_channel_message(
        &self,
        payload: DataChannelPayload,
    ) -> Self::Output {
        match payload {
            DataChannelPayload::Text(frame) => self.receive_text(&frame),
            DataChannelPayload::Binary(frame) => {
                let chunk =
                    Chunk::parse(frame).map_err(tracerr::from_and_wrap!())?;
                self.transfers.borrow_mut().push(chunk);
                Ok(())
            }
        }
    }

    async fn on_remote_track_added(&self, track: RemoteTrack) -> Self::Output {
        self.emit(SessionEvent::RemoteTrackAdded { track });
        Ok(())
    }

    async fn on_connection_closed(&self) -> Self::Output {
        self.close(CloseReason::TransportClosed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use futures::{
        executor::{block_on, LocalPool},
        FutureExt as _, StreamExt as _,
    };
    use peerlink_signalling_proto::{Channel, StreamKind};

    use crate::{
        loopback::{
            FailurePoint, InMemoryBlobStorage, LoopbackMediaStream,
            LoopbackNetwork, LoopbackSignalling, LoopbackTransportFactory,
        },
        platform::MockSignallingClient,
    };

    use super::*;

    fn identity() -> ChannelIdentity {
        ChannelIdentity::p2p(
            "1",
            Channel::user("1", "alice"),
            Channel::user("2", "bob"),
        )
        .unwrap()
    }

    fn context(
        pool: &LocalPool,
        signalling: Rc<dyn SignallingClient>,
        transports: LoopbackTransportFactory,
    ) -> (SessionContext, Rc<InMemoryBlobStorage>) {
        let blobs = Rc::new(InMemoryBlobStorage::default());
        let ctx = SessionContext {
            signalling,
            transports: Rc::new(transports),
            blobs: blobs.clone(),
            spawner: Rc::new(pool.spawner()),
            transfer: conf::Transfer::default(),
        };
        (ctx, blobs)
    }

    fn drain(
        events: &mut LocalBoxStream<'static, SessionEvent>,
    ) -> Vec<SessionEvent> {
        let mut drained = Vec::new();
        while let Some(Some(event)) = events.next().now_or_never() {
            drained.push(event);
        }
        drained
    }

    fn receive(session: &CallSession, payload: DataChannelPayload) {
        block_on(session.0.on_data_channel_message(payload)).unwrap();
    }

    #[test]
    fn close_is_idempotent() {
        let pool = LocalPool::new();
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity(), ctx);
        let mut events = session.subscribe();

        session.close(CloseReason::Local);
        session.close(CloseReason::RemoteBye);

        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Local));
        match drain(&mut events).as_slice() {
            [SessionEvent::Closed { identity: closed, reason }] => {
                assert_eq!(closed, &identity());
                assert_eq!(*reason, CloseReason::Local);
            }
            events => panic!("unexpected events: {:?}", events),
        }
        assert!(matches!(events.next().now_or_never(), Some(None)));
    }

    #[test]
    fn partial_transfer_is_discarded_on_close() {
        let pool = LocalPool::new();
        let (ctx, blobs) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity().reversed(), ctx);
        let mut events = session.subscribe();

        let (frames, _) =
            transfer::split(0, &Bytes::from(vec![1; 40_000]), 16 * 1024);
        for frame in frames.into_iter().take(2) {
            receive(&session, DataChannelPayload::Binary(frame));
        }
        assert_eq!(session.pending_transfers(), 1);

        session.close(CloseReason::Local);

        assert_eq!(session.pending_transfers(), 0);
        assert!(blobs.is_empty());
        assert!(drain(&mut events)
            .iter()
            .all(|e| matches!(e, SessionEvent::Closed { .. })));
    }

    #[test]
    fn trailer_completes_transfer() {
        let pool = LocalPool::new();
        let (ctx, blobs) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity().reversed(), ctx);
        let mut events = session.subscribe();

        let video = Bytes::from(vec![3; 20_000]);
        let (frames, trailer) = transfer::split(4, &video, 16 * 1024);
        for frame in frames {
            receive(&session, DataChannelPayload::Binary(frame));
        }
        assert!(drain(&mut events).is_empty());

        let message = ChannelMessage::system_command(
            identity(),
            SystemCommand::VideoChunksSent,
        )
        .with_user_name("alice")
        .with_transfer(trailer);
        receive(
            &session,
            DataChannelPayload::Text(message.to_json().unwrap()),
        );

        match drain(&mut events).as_slice() {
            [SessionEvent::MessageReceived { message }] => {
                assert_eq!(message.kind, MessageKind::Video);
                assert_eq!(message.user_name.as_deref(), Some("alice"));
                assert_eq!(message.identity.from(), identity().to());
                assert_eq!(blobs.get(&message.payload), Some(video));
            }
            events => panic!("unexpected events: {:?}", events),
        }
        assert_eq!(session.pending_transfers(), 0);
    }

    #[test]
    fn unknown_command_is_dropped() {
        let pool = LocalPool::new();
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity().reversed(), ctx);
        let mut events = session.subscribe();

        let mut message = ChannelMessage::system_command(
            identity(),
            SystemCommand::MuteAudio,
        );
        message.payload = "self-destruct".to_owned();
        let res = block_on(session.0.on_data_channel_message(
            DataChannelPayload::Text(message.to_json().unwrap()),
        ));

        assert!(matches!(
            res.unwrap_err().as_ref(),
            SessionError::Parse(ParseError::UnknownCommand(_)),
        ));
        assert!(drain(&mut events).is_empty());
        assert_eq!(session.phase(), SessionPhase::Idle);
    }

    #[test]
    fn reserved_command_is_passed_through() {
        let pool = LocalPool::new();
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity().reversed(), ctx);
        let mut events = session.subscribe();

        let message = ChannelMessage::system_command(
            identity(),
            SystemCommand::JoinCallRequest,
        );
        receive(
            &session,
            DataChannelPayload::Text(message.to_json().unwrap()),
        );

        assert!(matches!(
            drain(&mut events).as_slice(),
            [SessionEvent::SystemCommandReceived {
                command: SystemCommand::JoinCallRequest,
                ..
            }],
        ));
    }

    #[test]
    fn call_can_be_started_once() {
        let mut pool = LocalPool::new();
        let (signalling, _remote) = LoopbackSignalling::pair();
        let (ctx, _) = context(
            &pool,
            Rc::new(signalling),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity(), ctx);

        pool.run_until(session.start_call(None)).unwrap();
        assert_eq!(session.phase(), SessionPhase::Negotiating);
        assert_eq!(session.role(), Some(NegotiationRole::Offerer));

        let err = pool.run_until(session.start_call(None)).unwrap_err();
        assert!(matches!(
            err.as_ref(),
            SessionError::State(StateError::AlreadyStarted(
                SessionPhase::Negotiating
            )),
        ));
        assert_eq!(session.phase(), SessionPhase::Negotiating);
    }

    #[test]
    fn transport_failure_closes_session() {
        let mut pool = LocalPool::new();
        let transports = LoopbackNetwork::new().endpoint();
        transports.fail_at(Some(FailurePoint::CreateTransport));
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            transports,
        );
        let stream: Rc<dyn LocalMediaStream> =
            Rc::new(LoopbackMediaStream::new(vec![StreamKind::Video]));
        let session =
            CallSession::new(identity().with_stream(StreamKind::Video), ctx);

        let err = pool
            .run_until(session.start_call(Some(Rc::clone(&stream))))
            .unwrap_err();

        assert!(matches!(err.as_ref(), SessionError::Transport(_)));
        assert_eq!(session.phase(), SessionPhase::Closed);
        assert_eq!(
            session.close_reason(),
            Some(CloseReason::NegotiationFailed),
        );
        assert!(stream.is_stopped());
    }

    #[test]
    fn unexpected_answer_is_rejected() {
        let mut pool = LocalPool::new();
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity(), ctx);

        session.handle_signal(Signal::Answer {
            sdp: "v=0".to_owned(),
        });
        pool.run_until_stalled();

        assert_eq!(session.phase(), SessionPhase::Idle);
        assert_eq!(session.role(), None);
    }

    #[test]
    fn send_requires_connected_session() {
        let pool = LocalPool::new();
        let (ctx, _) = context(
            &pool,
            Rc::new(MockSignallingClient::new()),
            LoopbackNetwork::new().endpoint(),
        );
        let session = CallSession::new(identity(), ctx);

        let err = session
            .send_message(&ChannelMessage::outgoing(
                identity(),
                MessageKind::Text,
                "hello",
            ))
            .unwrap_err();
        assert!(matches!(
            err.as_ref(),
            SessionError::State(StateError::NotConnected(SessionPhase::Idle)),
        ));

        let err = session
            .send_media(MessageKind::Text, &Bytes::new())
            .unwrap_err();
        assert!(matches!(
            err.as_ref(),
            SessionError::State(StateError::NotMedia(MessageKind::Text)),
        ));
    }
}
