//! In-memory implementations of the [`platform`] traits.
//!
//! Lets two endpoints live in one process: the demo binary and the tests run
//! two [`MessageRouter`]s linked with a [`LoopbackSignalling::pair()`] and
//! factories of one [`LoopbackNetwork`].
//!
//! Loopback transports link once both of them have their local and remote
//! descriptions applied. Linking opens the mirrored [`DataChannel`]s and
//! announces already attached local media as remote tracks.
//!
//! [`MessageRouter`]: crate::MessageRouter
//! [`platform`]: crate::platform

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    rc::{Rc, Weak},
};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{channel::mpsc, stream::LocalBoxStream};
use peerlink_signalling_proto::{
    ChannelIdentity, IceCandidate, MessageKind, SignallingEnvelope, StreamKind,
};
use tracerr::Traced;

use crate::platform::{
    BlobStorage, DataChannel, DataChannelPayload, LocalMediaStream,
    MediaRecorder, PeerTransport, PeerTransportEvent, PeerTransportFactory,
    RemoteTrack, SdpType, SignallingClient, TransportError,
};

/// Broadcasts values to all of its live subscribers.
struct Subscribers<T>(RefCell<Vec<mpsc::UnboundedSender<T>>>);

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self(RefCell::default())
    }
}

impl<T: Clone + 'static> Subscribers<T> {
    fn subscribe(&self) -> LocalBoxStream<'static, T> {
        let (tx, rx) = mpsc::unbounded();
        self.0.borrow_mut().push(tx);
        Box::pin(rx)
    }

    fn send(&self, value: &T) {
        self.0
            .borrow_mut()
            .retain(|tx| tx.unbounded_send(value.clone()).is_ok());
    }

    /// Ends the streams of all the subscribers.
    fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

/// One side of a [`LoopbackSignalling`] relay.
#[derive(Default)]
struct RelaySide {
    envelopes: Subscribers<SignallingEnvelope>,
    connection_loss: Subscribers<()>,
}

/// [`SignallingClient`] relaying [`SignallingEnvelope`]s to its paired
/// client in the same process.
///
/// Clones share the same side of the relay.
#[derive(Clone)]
pub struct LoopbackSignalling {
    local: Rc<RelaySide>,
    remote: Rc<RelaySide>,
    connected: Rc<Cell<bool>>,
}

impl LoopbackSignalling {
    /// Creates two connected [`LoopbackSignalling`] clients.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let first = Rc::new(RelaySide::default());
        let second = Rc::new(RelaySide::default());
        let connected = Rc::new(Cell::new(true));
        (
            Self {
                local: Rc::clone(&first),
                remote: Rc::clone(&second),
                connected: Rc::clone(&connected),
            },
            Self {
                local: second,
                remote: first,
                connected,
            },
        )
    }

    /// Indicates whether the relay still forwards envelopes.
    #[inline]
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.get()
    }

    /// Breaks the relay, notifying both clients about the connection loss.
    pub fn disconnect(&self) {
        if self.connected.replace(false) {
            self.local.connection_loss.send(&());
            self.remote.connection_loss.send(&());
        }
    }
}

impl SignallingClient for LoopbackSignalling {
    fn send(
        &self,
        envelope: &SignallingEnvelope,
    ) -> Result<(), Traced<TransportError>> {
        if !self.connected.get() {
            return Err(tracerr::new!(TransportError::SendSignal(
                "relay is disconnected".to_owned()
            )));
        }
        self.remote.envelopes.send(envelope);
        Ok(())
    }

    fn subscribe(&self) -> LocalBoxStream<'static, SignallingEnvelope> {
        self.local.envelopes.subscribe()
    }

    fn on_connection_loss(&self) -> LocalBoxStream<'static, ()> {
        self.local.connection_loss.subscribe()
    }
}

/// Step of a [`LoopbackTransport`] forced to fail.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailurePoint {
    /// [`PeerTransportFactory::create()`].
    CreateTransport,

    /// [`PeerTransport::create_offer()`].
    CreateOffer,

    /// [`PeerTransport::create_answer()`].
    CreateAnswer,

    /// [`PeerTransport::set_remote_description()`].
    SetRemoteDescription,
}

#[derive(Default)]
struct NetworkState {
    /// Transports created for every [`ChannelIdentity::name()`].
    transports: RefCell<HashMap<String, Vec<Weak<TransportInner>>>>,

    /// ID of the next endpoint.
    next_endpoint: Cell<usize>,
}

impl NetworkState {
    fn register(&self, transport: &Rc<TransportInner>) {
        let mut transports = self.transports.borrow_mut();
        let entry = transports.entry(transport.identity.name().to_owned());
        let registered = entry.or_default();
        registered.retain(|t| t.strong_count() > 0);
        registered.push(Rc::downgrade(transport));
    }

    fn unregister(&self, transport: &TransportInner) {
        let mut transports = self.transports.borrow_mut();
        if let Some(registered) = transports.get_mut(transport.identity.name())
        {
            registered.retain(|t| {
                t.upgrade().map_or(false, |t| {
                    !std::ptr::eq(Rc::as_ptr(&t), transport) && !t.closed.get()
                })
            });
            if registered.is_empty() {
                drop(transports.remove(transport.identity.name()));
            }
        }
    }

    /// Returns a transport of another endpoint ready to be linked with the
    /// provided one.
    fn counterpart(
        &self,
        transport: &TransportInner,
    ) -> Option<Rc<TransportInner>> {
        self.transports
            .borrow()
            .get(transport.identity.name())?
            .iter()
            .filter_map(Weak::upgrade)
            .find(|t| {
                t.endpoint != transport.endpoint
                    && !t.closed.get()
                    && t.is_described()
                    && t.peer.borrow().upgrade().is_none()
            })
    }
}

/// In-process network linking [`LoopbackTransport`]s of different endpoints
/// negotiating the same [`ChannelIdentity`].
#[derive(Clone, Default)]
pub struct LoopbackNetwork(Rc<NetworkState>);

impl LoopbackNetwork {
    /// Creates a new empty [`LoopbackNetwork`].
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a [`PeerTransportFactory`] of a new endpoint of this network.
    #[must_use]
    pub fn endpoint(&self) -> LoopbackTransportFactory {
        let endpoint = self.0.next_endpoint.get();
        self.0.next_endpoint.set(endpoint + 1);
        LoopbackTransportFactory {
            network: Rc::clone(&self.0),
            endpoint,
            failure: Rc::default(),
        }
    }
}

/// [`PeerTransportFactory`] of one endpoint of a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransportFactory {
    network: Rc<NetworkState>,
    endpoint: usize,
    failure: Rc<Cell<Option<FailurePoint>>>,
}

impl LoopbackTransportFactory {
    /// Makes all the transports created afterwards fail at the provided
    /// step. [`None`] disables failures.
    #[inline]
    pub fn fail_at(&self, point: Option<FailurePoint>) {
        self.failure.set(point);
    }
}

impl PeerTransportFactory for LoopbackTransportFactory {
    fn create(
        &self,
        identity: &ChannelIdentity,
    ) -> Result<Rc<dyn PeerTransport>, Traced<TransportError>> {
        if self.failure.get() == Some(FailurePoint::CreateTransport) {
            return Err(tracerr::new!(TransportError::CreateTransport(
                "injected failure".to_owned()
            )));
        }

        let inner = Rc::new(TransportInner {
            network: Rc::clone(&self.network),
            identity: identity.clone(),
            endpoint: self.endpoint,
            failure: self.failure.get(),
            local_description: RefCell::new(None),
            remote_description: RefCell::new(None),
            remote_candidates: RefCell::default(),
            channels: RefCell::default(),
            local_kinds: RefCell::default(),
            peer: RefCell::new(Weak::new()),
            events: Subscribers::default(),
            closed: Cell::new(false),
        });
        self.network.register(&inner);

        Ok(Rc::new(LoopbackTransport(inner)))
    }
}

struct TransportInner {
    network: Rc<NetworkState>,
    identity: ChannelIdentity,
    endpoint: usize,
    failure: Option<FailurePoint>,
    local_description: RefCell<Option<SdpType>>,
    remote_description: RefCell<Option<SdpType>>,
    remote_candidates: RefCell<Vec<IceCandidate>>,
    channels: RefCell<Vec<Rc<LoopbackDataChannel>>>,
    local_kinds: RefCell<Vec<StreamKind>>,
    peer: RefCell<Weak<TransportInner>>,
    events: Subscribers<PeerTransportEvent>,
    closed: Cell<bool>,
}

impl TransportInner {
    fn fail_if(
        &self,
        point: FailurePoint,
    ) -> Result<(), Traced<TransportError>> {
        if self.failure == Some(point) {
            return Err(tracerr::new!(TransportError::Negotiation(format!(
                "injected {:?} failure",
                point,
            ))));
        }
        if self.closed.get() {
            return Err(tracerr::new!(TransportError::Negotiation(
                "transport is closed".to_owned()
            )));
        }
        Ok(())
    }

    fn is_described(&self) -> bool {
        self.local_description.borrow().is_some()
            && self.remote_description.borrow().is_some()
    }

    /// Announces the provided local media kinds to the linked peer.
    fn announce_tracks(&self, kinds: &[StreamKind]) {
        if let Some(peer) = self.peer.borrow().upgrade() {
            for kind in kinds {
                peer.events.send(&PeerTransportEvent::RemoteTrackAdded {
                    track: RemoteTrack {
                        identity: peer.identity.clone(),
                        kind: *kind,
                        id: format!("{}-{}", self.endpoint, kind.as_str()),
                    },
                });
            }
        }
    }

    /// Opens the counterparts of the locally created data channels on the
    /// linked peer.
    fn mirror_channels(&self, channels: &[Rc<LoopbackDataChannel>]) {
        let peer = match self.peer.borrow().upgrade() {
            Some(peer) => peer,
            None => return,
        };
        let me = peer.peer.borrow().clone();
        for channel in channels {
            let remote = Rc::new(LoopbackDataChannel::new(channel.label()));
            channel.open(Rc::downgrade(&peer));
            remote.open(me.clone());
            peer.channels.borrow_mut().push(Rc::clone(&remote));

            self.events.send(&PeerTransportEvent::DataChannelOpened {
                channel: Rc::clone(channel) as Rc<dyn DataChannel>,
            });
            peer.events.send(&PeerTransportEvent::DataChannelOpened {
                channel: remote,
            });
        }
    }
}

/// Links the provided transport with its counterpart, if both are fully
/// described.
fn try_link(transport: &Rc<TransportInner>) {
    if !transport.is_described()
        || transport.peer.borrow().upgrade().is_some()
    {
        return;
    }
    let peer = match transport.network.counterpart(transport) {
        Some(peer) => peer,
        None => return,
    };
    log::trace!(
        "Linking loopback transports of `{}`: {} <-> {}",
        transport.identity,
        transport.endpoint,
        peer.endpoint,
    );
    transport.peer.replace(Rc::downgrade(&peer));
    peer.peer.replace(Rc::downgrade(transport));

    let own_channels = transport.channels.borrow().clone();
    let peer_channels = peer.channels.borrow().clone();
    transport.mirror_channels(&own_channels);
    peer.mirror_channels(&peer_channels);

    transport.announce_tracks(&transport.local_kinds.borrow());
    peer.announce_tracks(&peer.local_kinds.borrow());
}

/// [`PeerTransport`] of a [`LoopbackNetwork`].
pub struct LoopbackTransport(Rc<TransportInner>);

#[async_trait(?Send)]
impl PeerTransport for LoopbackTransport {
    async fn create_offer(&self) -> Result<String, Traced<TransportError>> {
        self.0.fail_if(FailurePoint::CreateOffer)?;
        Ok(format!(
            "v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns={}\r\na=offer\r\n",
            self.0.endpoint, self.0.identity,
        ))
    }

    async fn create_answer(&self) -> Result<String, Traced<TransportError>> {
        self.0.fail_if(FailurePoint::CreateAnswer)?;
        match self.0.remote_description.borrow().as_ref() {
            Some(SdpType::Offer(_)) => Ok(format!(
                "v=0\r\no=loopback {} 0 IN IP4 127.0.0.1\r\ns={}\r\n\
                 a=answer\r\n",
                self.0.endpoint, self.0.identity,
            )),
            _ => Err(tracerr::new!(TransportError::Negotiation(
                "no remote offer to answer".to_owned()
            ))),
        }
    }

    async fn set_local_description(
        &self,
        sdp: SdpType,
    ) -> Result<(), Traced<TransportError>> {
        if self.0.closed.get() {
            return Err(tracerr::new!(TransportError::Negotiation(
                "transport is closed".to_owned()
            )));
        }
        self.0.local_description.replace(Some(sdp));
        self.0.events.send(&PeerTransportEvent::IceCandidateDiscovered {
            candidate: IceCandidate {
                candidate: format!(
                    "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                    self.0.endpoint,
                    50_000 + self.0.endpoint,
                ),
                sdp_m_line_index: Some(0),
                sdp_mid: Some("0".to_owned()),
            },
        });
        try_link(&self.0);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        sdp: SdpType,
    ) -> Result<(), Traced<TransportError>> {
        self.0.fail_if(FailurePoint::SetRemoteDescription)?;
        self.0.remote_description.replace(Some(sdp));
        try_link(&self.0);
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: IceCandidate,
    ) -> Result<(), Traced<TransportError>> {
        if self.0.remote_description.borrow().is_none() {
            return Err(tracerr::new!(TransportError::AddIceCandidate(
                "no remote description".to_owned()
            )));
        }
        self.0.remote_candidates.borrow_mut().push(candidate);
        Ok(())
    }

    fn create_data_channel(
        &self,
        label: &str,
    ) -> Result<Rc<dyn DataChannel>, Traced<TransportError>> {
        if self.0.closed.get() {
            return Err(tracerr::new!(TransportError::CreateDataChannel(
                "transport is closed".to_owned()
            )));
        }
        let channel = Rc::new(LoopbackDataChannel::new(label.to_owned()));
        self.0.channels.borrow_mut().push(Rc::clone(&channel));
        Ok(channel)
    }

    fn add_local_stream(
        &self,
        stream: &Rc<dyn LocalMediaStream>,
    ) -> Result<(), Traced<TransportError>> {
        if self.0.closed.get() || stream.is_stopped() {
            return Err(tracerr::new!(TransportError::AddLocalStream(
                "transport is closed or stream is stopped".to_owned()
            )));
        }
        let kinds = stream.kinds();
        self.0.local_kinds.borrow_mut().extend(kinds.iter().copied());
        self.0.announce_tracks(&kinds);
        Ok(())
    }

    fn on_event(&self) -> LocalBoxStream<'static, PeerTransportEvent> {
        self.0.events.subscribe()
    }

    fn close(&self) {
        if self.0.closed.replace(true) {
            return;
        }
        for channel in self.0.channels.borrow().iter() {
            channel.close();
        }
        let peer = self.0.peer.replace(Weak::new()).upgrade();
        if let Some(peer) = peer {
            if !peer.closed.get() {
                peer.events.send(&PeerTransportEvent::ConnectionClosed);
            }
        }
        self.0.network.unregister(&self.0);
        self.0.events.clear();
    }
}

/// [`DataChannel`] of a [`LoopbackTransport`].
#[derive(Debug)]
pub struct LoopbackDataChannel {
    label: String,
    is_open: Cell<bool>,
    remote: RefCell<Weak<TransportInner>>,
}

impl LoopbackDataChannel {
    fn new(label: String) -> Self {
        Self {
            label,
            is_open: Cell::new(false),
            remote: RefCell::new(Weak::new()),
        }
    }

    fn open(&self, remote: Weak<TransportInner>) {
        self.remote.replace(remote);
        self.is_open.set(true);
    }
}

impl DataChannel for LoopbackDataChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.is_open.get()
    }

    fn send(
        &self,
        payload: DataChannelPayload,
    ) -> Result<(), Traced<TransportError>> {
        if !self.is_open.get() {
            return Err(tracerr::new!(TransportError::DataChannelClosed(
                self.label.clone()
            )));
        }
        match self.remote.borrow().upgrade() {
            Some(remote) if !remote.closed.get() => {
                remote
                    .events
                    .send(&PeerTransportEvent::DataChannelMessage { payload });
                Ok(())
            }
            _ => Err(tracerr::new!(TransportError::SendData(
                "remote transport is gone".to_owned()
            ))),
        }
    }

    fn close(&self) {
        self.is_open.set(false);
    }
}

/// [`BlobStorage`] keeping blobs in memory.
#[derive(Debug, Default)]
pub struct InMemoryBlobStorage {
    blobs: RefCell<HashMap<String, Bytes>>,
    next_id: Cell<u64>,
}

impl InMemoryBlobStorage {
    /// Returns number of the stored blobs.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.borrow().len()
    }

    /// Indicates whether nothing is stored.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.borrow().is_empty()
    }
}

impl BlobStorage for InMemoryBlobStorage {
    fn store(&self, kind: MessageKind, bytes: Bytes) -> String {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let reference =
            format!("blob:{}/{}", format!("{:?}", kind).to_lowercase(), id);
        drop(self.blobs.borrow_mut().insert(reference.clone(), bytes));
        reference
    }

    fn get(&self, reference: &str) -> Option<Bytes> {
        self.blobs.borrow().get(reference).cloned()
    }
}

/// [`MediaRecorder`] finishing captures provided with
/// [`LoopbackRecorder::record()`].
#[derive(Debug, Default)]
pub struct LoopbackRecorder {
    captures: RefCell<HashMap<MessageKind, Bytes>>,
}

impl LoopbackRecorder {
    /// Sets the bytes the next [`MediaRecorder::finish()`] of the provided
    /// `kind` returns.
    pub fn record(&self, kind: MessageKind, bytes: Bytes) {
        drop(self.captures.borrow_mut().insert(kind, bytes));
    }
}

#[async_trait(?Send)]
impl MediaRecorder for LoopbackRecorder {
    async fn finish(
        &self,
        kind: MessageKind,
    ) -> Result<Bytes, Traced<TransportError>> {
        self.captures.borrow_mut().remove(&kind).ok_or_else(|| {
            tracerr::new!(TransportError::Media(format!(
                "no {:?} capture in progress",
                kind,
            )))
        })
    }
}

/// [`LocalMediaStream`] of fake tracks.
#[derive(Debug)]
pub struct LoopbackMediaStream {
    kinds: Vec<StreamKind>,
    stopped: Cell<bool>,
}

impl LoopbackMediaStream {
    /// Creates a live stream with tracks of the provided kinds.
    #[must_use]
    pub fn new(kinds: Vec<StreamKind>) -> Self {
        Self {
            kinds,
            stopped: Cell::new(false),
        }
    }
}

impl LocalMediaStream for LoopbackMediaStream {
    fn kinds(&self) -> Vec<StreamKind> {
        self.kinds.clone()
    }

    fn stop(&self) {
        self.stopped.set(true);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.get()
    }
}
