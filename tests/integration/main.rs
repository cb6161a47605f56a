#![allow(clippy::module_name_repetitions)]
#![forbid(non_ascii_idents, unsafe_code)]

mod lifecycle;
mod messaging;
mod relay;
mod streaming;

use std::{cell::RefCell, rc::Rc};

use futures::executor::LocalPool;
use peerlink::{
    loopback::{
        InMemoryBlobStorage, LoopbackNetwork, LoopbackRecorder,
        LoopbackSignalling, LoopbackTransportFactory,
    },
    platform::RemoteTrack,
    proto::{Channel, ChannelIdentity, ChannelMessage, SystemCommand},
    Conf, MessageRouter,
};

/// Everything one endpoint of a [`World`] consists of.
pub struct Endpoint {
    pub router: MessageRouter,
    pub transports: LoopbackTransportFactory,
    pub recorder: Rc<LoopbackRecorder>,
    pub blobs: Rc<InMemoryBlobStorage>,
    pub received: Rc<RefCell<Vec<ChannelMessage>>>,
    pub commands: Rc<RefCell<Vec<(ChannelMessage, SystemCommand)>>>,
    pub tracks: Rc<RefCell<Vec<RemoteTrack>>>,
}

impl Endpoint {
    fn new(
        conf: &Conf,
        pool: &LocalPool,
        signalling: LoopbackSignalling,
        network: &LoopbackNetwork,
    ) -> Self {
        let transports = network.endpoint();
        let recorder = Rc::new(LoopbackRecorder::default());
        let blobs = Rc::new(InMemoryBlobStorage::default());
        let router = MessageRouter::new(
            conf,
            Rc::new(signalling),
            Rc::new(transports.clone()),
            recorder.clone(),
            blobs.clone(),
            Rc::new(pool.spawner()),
        );

        let received = Rc::new(RefCell::new(Vec::new()));
        let commands = Rc::new(RefCell::new(Vec::new()));
        let tracks = Rc::new(RefCell::new(Vec::new()));
        let received_clone = Rc::clone(&received);
        router.on_message(move |msg| received_clone.borrow_mut().push(msg));
        let commands_clone = Rc::clone(&commands);
        router.on_system_command(move |cmd| {
            commands_clone.borrow_mut().push(cmd)
        });
        let tracks_clone = Rc::clone(&tracks);
        router.on_remote_stream(move |t| tracks_clone.borrow_mut().push(t));

        Self {
            router,
            transports,
            recorder,
            blobs,
            received,
            commands,
            tracks,
        }
    }
}

/// Two endpoints (`alice` and `bob`) linked with an in-memory relay and
/// network.
pub struct World {
    pub pool: LocalPool,
    pub relay: LoopbackSignalling,
    pub alice: Endpoint,
    pub bob: Endpoint,
}

impl World {
    pub fn new() -> Self {
        Self::with_conf(&Conf::default())
    }

    pub fn with_conf(conf: &Conf) -> Self {
        let pool = LocalPool::new();
        let network = LoopbackNetwork::new();
        let (alice_relay, bob_relay) = LoopbackSignalling::pair();
        let relay = alice_relay.clone();
        let alice = Endpoint::new(conf, &pool, alice_relay, &network);
        let bob = Endpoint::new(conf, &pool, bob_relay, &network);
        Self {
            pool,
            relay,
            alice,
            bob,
        }
    }

    /// Runs all the spawned tasks until none of them can make progress.
    pub fn settle(&mut self) {
        self.pool.run_until_stalled();
    }

    /// Connects the provided identity from `alice`'s side and waits for
    /// negotiation to finish.
    pub fn connect(&mut self, identity: &ChannelIdentity) -> bool {
        let connected =
            self.pool.run_until(self.alice.router.connect(identity));
        self.settle();
        connected
    }
}

/// Returns `alice`'s [`ChannelIdentity`] of the data channel with `bob`.
pub fn identity() -> ChannelIdentity {
    ChannelIdentity::p2p(
        "1",
        Channel::user("1", "alice"),
        Channel::user("2", "bob"),
    )
    .unwrap()
}
