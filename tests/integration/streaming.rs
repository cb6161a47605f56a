use std::rc::Rc;

use peerlink::{
    loopback::LoopbackMediaStream,
    platform::LocalMediaStream as _,
    proto::{StreamKind, SystemCommand},
    SessionPhase,
};

use crate::{identity, World};

/// Connects the data channel and starts `alice`'s video stream.
fn stream_video(world: &mut World) -> Rc<LoopbackMediaStream> {
    let data = identity();
    let video = data.with_stream(StreamKind::Video);
    assert!(world.connect(&data));

    let stream = Rc::new(LoopbackMediaStream::new(vec![StreamKind::Video]));
    let started = world
        .pool
        .run_until(world.alice.router.start_streaming(&video, stream.clone()));
    world.settle();
    assert!(started);

    stream
}

#[test]
fn stream_subchannel_is_independent() {
    let mut world = World::new();
    let data = identity();
    let video = data.with_stream(StreamKind::Video);
    let stream = stream_video(&mut world);

    assert_eq!(video.name(), "tenant-1-stream-video-p2p-usr-1-usr-2");
    for router in &[&world.alice.router, &world.bob.router] {
        assert_eq!(router.phase(&data), Some(SessionPhase::Connected));
        assert_eq!(router.phase(&video), Some(SessionPhase::Connected));
        assert!(!router
            .session(&data)
            .unwrap()
            .ptr_eq(&router.session(&video).unwrap()));
    }

    {
        let tracks = world.bob.tracks.borrow();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].kind, StreamKind::Video);
        assert_eq!(tracks[0].identity, video);
    }
    {
        let commands = world.bob.commands.borrow();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1, SystemCommand::CallConnectionStarted);
        assert_eq!(commands[0].0.identity, data);
    }

    assert!(world.alice.router.stop_streaming(&video));
    world.settle();

    assert!(stream.is_stopped());
    for router in &[&world.alice.router, &world.bob.router] {
        assert_eq!(router.phase(&video), None);
        assert_eq!(router.phase(&data), Some(SessionPhase::Connected));
    }
    assert_eq!(
        world.bob.commands.borrow().last().map(|(_, c)| *c),
        Some(SystemCommand::CallConnectionStopped),
    );

    assert!(world.alice.router.send_text(&data, "still here").is_some());
    world.settle();
    assert_eq!(
        world
            .bob
            .router
            .messages(data.name())
            .last()
            .map(|m| m.payload.clone()),
        Some("still here".to_owned()),
    );
}

#[test]
fn closing_data_session_keeps_stream() {
    let mut world = World::new();
    let data = identity();
    let video = data.with_stream(StreamKind::Video);
    let stream = stream_video(&mut world);

    assert!(world.alice.router.disconnect(&data));
    world.settle();

    assert!(!stream.is_stopped());
    for router in &[&world.alice.router, &world.bob.router] {
        assert_eq!(router.phase(&data), None);
        assert_eq!(router.phase(&video), Some(SessionPhase::Connected));
    }
}

#[test]
fn call_connection_stopped_closes_remote_streams() {
    let mut world = World::new();
    let data = identity();
    let video = data.with_stream(StreamKind::Video);
    let stream = stream_video(&mut world);

    assert!(world
        .alice
        .router
        .send_system_command(&data, SystemCommand::CallConnectionStopped)
        .is_some());
    world.settle();

    assert!(stream.is_stopped());
    for router in &[&world.alice.router, &world.bob.router] {
        assert_eq!(router.phase(&video), None);
        assert_eq!(router.phase(&data), Some(SessionPhase::Connected));
    }
}

#[test]
fn streaming_requires_stream_identity() {
    let mut world = World::new();
    let data = identity();
    assert!(world.connect(&data));

    let stream = Rc::new(LoopbackMediaStream::new(vec![StreamKind::Audio]));
    let started = world
        .pool
        .run_until(world.alice.router.start_streaming(&data, stream.clone()));

    assert!(!started);
    assert!(!stream.is_stopped());
    assert!(!world.alice.router.stop_streaming(&data));
    assert_eq!(
        world.alice.router.phase(&data),
        Some(SessionPhase::Connected),
    );
}
