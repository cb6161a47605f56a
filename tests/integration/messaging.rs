use bytes::Bytes;
use peerlink::{
    platform::BlobStorage as _,
    proto::{Direction, MessageKind},
    SessionPhase,
};

use crate::{identity, World};

#[test]
fn text_reaches_remote_history() {
    let mut world = World::new();
    let identity = identity();
    assert_eq!(identity.name(), "tenant-1-data-p2p-usr-1-usr-2");

    assert!(world.connect(&identity));
    assert_eq!(
        world.alice.router.phase(&identity),
        Some(SessionPhase::Connected),
    );
    assert_eq!(
        world.bob.router.phase(&identity.reversed()),
        Some(SessionPhase::Connected),
    );

    let sent = world.alice.router.send_text(&identity, "hello").unwrap();
    world.settle();

    let alice_history = world.alice.router.messages(identity.name());
    assert_eq!(alice_history, vec![sent]);
    assert_eq!(alice_history[0].kind, MessageKind::Text);
    assert_eq!(alice_history[0].direction, Direction::Out);
    assert_eq!(alice_history[0].payload, "hello");

    let bob_history = world.bob.router.messages(identity.name());
    assert_eq!(bob_history.len(), 1);
    assert_eq!(bob_history[0].kind, MessageKind::Text);
    assert_eq!(bob_history[0].direction, Direction::In);
    assert_eq!(bob_history[0].payload, "hello");
    assert_eq!(bob_history[0].user_name.as_deref(), Some("alice"));
    assert_eq!(bob_history[0].identity.from(), identity.to());
    assert_eq!(*world.bob.received.borrow(), bob_history);
}

#[test]
fn history_is_kept_per_channel() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));

    drop(world.alice.router.send_text(&identity, "one"));
    world.settle();
    drop(world.bob.router.send_text(&identity.reversed(), "two"));
    world.settle();

    let payloads = |history: Vec<peerlink::proto::ChannelMessage>| {
        history
            .into_iter()
            .map(|m| (m.direction, m.payload))
            .collect::<Vec<_>>()
    };
    assert_eq!(
        payloads(world.alice.router.messages(identity.name())),
        vec![
            (Direction::Out, "one".to_owned()),
            (Direction::In, "two".to_owned()),
        ],
    );
    assert_eq!(
        payloads(world.bob.router.messages(identity.name())),
        vec![
            (Direction::In, "one".to_owned()),
            (Direction::Out, "two".to_owned()),
        ],
    );
    assert!(world.alice.router.messages("tenant-1-data-grp-9").is_empty());
}

#[test]
fn sending_without_session_fails() {
    let world = World::new();
    let identity = identity();

    assert!(world.alice.router.send_text(&identity, "hello").is_none());
    assert!(world.alice.router.messages(identity.name()).is_empty());
}

#[test]
fn video_is_transferred_in_chunks() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));

    let video: Bytes = (0..81_920_u32).map(|i| (i % 256) as u8).collect();
    world.alice.recorder.record(MessageKind::Video, video.clone());
    let sent = world
        .pool
        .run_until(world.alice.router.send_video(&identity))
        .unwrap();
    world.settle();

    assert_eq!(sent.kind, MessageKind::Video);
    assert_eq!(sent.transfer.unwrap().chunks, 5);
    assert_eq!(world.alice.blobs.get(&sent.payload), Some(video.clone()));

    let bob_history = world.bob.router.messages(identity.name());
    assert_eq!(bob_history.len(), 1);
    assert_eq!(bob_history[0].kind, MessageKind::Video);
    assert_eq!(bob_history[0].direction, Direction::In);
    assert_eq!(world.bob.blobs.get(&bob_history[0].payload), Some(video));
    assert!(world.bob.commands.borrow().is_empty());
    assert_eq!(
        world
            .bob
            .router
            .session(&identity.reversed())
            .unwrap()
            .pending_transfers(),
        0,
    );
}

#[test]
fn audio_and_video_transfers_do_not_mix() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));

    let audio = Bytes::from(vec![1; 20_000]);
    let video = Bytes::from(vec![2; 50_000]);
    world.alice.recorder.record(MessageKind::Audio, audio.clone());
    world.alice.recorder.record(MessageKind::Video, video.clone());
    let router = world.alice.router.clone();
    let sent = world.pool.run_until(async {
        (
            router.send_audio(&identity).await,
            router.send_video(&identity).await,
        )
    });
    world.settle();
    assert!(sent.0.is_some() && sent.1.is_some());

    let bob_history = world.bob.router.messages(identity.name());
    let blobs: Vec<_> = bob_history
        .iter()
        .map(|m| (m.kind, world.bob.blobs.get(&m.payload).unwrap()))
        .collect();
    assert_eq!(
        blobs,
        vec![(MessageKind::Audio, audio), (MessageKind::Video, video)],
    );
}

#[test]
fn media_without_capture_is_not_sent() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));

    let sent = world.pool.run_until(world.alice.router.send_audio(&identity));
    world.settle();

    assert!(sent.is_none());
    assert!(world.alice.router.messages(identity.name()).is_empty());
    assert!(world.bob.router.messages(identity.name()).is_empty());
}
