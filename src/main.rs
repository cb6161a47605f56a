use std::rc::Rc;

use bytes::Bytes;
use futures::{executor::LocalPool, task::LocalSpawnExt as _};
use peerlink::{
    log::{self, prelude::*},
    loopback::{
        InMemoryBlobStorage, LoopbackNetwork, LoopbackRecorder,
        LoopbackSignalling,
    },
    proto::{Channel, ChannelIdentity, MessageKind},
    Conf, MessageRouter,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Conf::parse()?;

    let logger = log::new_dual_logger(
        std::io::stdout(),
        std::io::stderr(),
        config.log.level(),
    );
    let _log_guard = slog_scope::set_global_logger(logger);
    slog_stdlog::init()?;

    info!("Starting peerlink demo with {:?}", config);

    let mut pool = LocalPool::new();
    let spawner = Rc::new(pool.spawner());
    let network = LoopbackNetwork::new();
    let (alice_relay, bob_relay) = LoopbackSignalling::pair();

    let alice_recorder = Rc::new(LoopbackRecorder::default());
    let alice = MessageRouter::new(
        &config,
        Rc::new(alice_relay),
        Rc::new(network.endpoint()),
        alice_recorder.clone(),
        Rc::new(InMemoryBlobStorage::default()),
        spawner.clone(),
    );
    let bob = MessageRouter::new(
        &config,
        Rc::new(bob_relay),
        Rc::new(network.endpoint()),
        Rc::new(LoopbackRecorder::default()),
        Rc::new(InMemoryBlobStorage::default()),
        spawner.clone(),
    );
    bob.on_message(|msg| {
        info!(
            "Bob received {:?} from {:?}: {}",
            msg.kind, msg.user_name, msg.payload
        );
    });

    let identity = ChannelIdentity::p2p(
        "1",
        Channel::user("1", "alice"),
        Channel::user("2", "bob"),
    )?;

    let alice_clone = alice.clone();
    let identity_clone = identity.clone();
    spawner.spawn_local(async move {
        if !alice_clone.connect(&identity_clone).await {
            error!("Failed to connect `{}`", identity_clone);
        }
    })?;
    pool.run_until_stalled();
    info!("Alice's session is {:?}", alice.phase(&identity));

    drop(alice.send_text(&identity, "hello"));
    alice_recorder.record(MessageKind::Video, Bytes::from(vec![7; 40_000]));
    let alice_clone = alice.clone();
    let identity_clone = identity.clone();
    spawner.spawn_local(async move {
        drop(alice_clone.send_video(&identity_clone).await);
    })?;
    pool.run_until_stalled();

    info!(
        "Bob's history of `{}` has {} messages",
        identity,
        bob.messages(identity.name()).len()
    );

    alice.dispose();
    bob.dispose();
    pool.run_until_stalled();

    Ok(())
}
