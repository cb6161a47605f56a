use futures::{future, StreamExt as _};
use peerlink::{
    loopback::FailurePoint,
    proto::{Direction, SystemCommand},
    CloseReason, SessionPhase,
};

use crate::{identity, World};

#[test]
fn connect_reuses_session() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));
    let session = world.alice.router.session(&identity).unwrap();

    assert!(world.connect(&identity));
    assert!(session.ptr_eq(&world.alice.router.session(&identity).unwrap()));
    assert_eq!(session.phase(), SessionPhase::Connected);

    drop(world.bob.router.send_text(&identity.reversed(), "ping"));
    world.settle();

    let received = world.alice.router.messages(identity.name());
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].direction, Direction::In);
    assert_eq!(world.alice.received.borrow().len(), 1);
}

#[test]
fn disconnect_closes_both_sides() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));
    let session = world.bob.router.session(&identity).unwrap();

    assert!(world.alice.router.disconnect(&identity));
    world.settle();

    assert_eq!(world.alice.router.phase(&identity), None);
    assert_eq!(world.bob.router.phase(&identity), None);
    assert_eq!(session.phase(), SessionPhase::Closed);
    assert!(!world.alice.router.disconnect(&identity));
    assert!(world.alice.router.send_text(&identity, "hello").is_none());
}

#[test]
fn failed_negotiation_allows_reconnect() {
    let mut world = World::new();
    let identity = identity();

    world.bob.transports.fail_at(Some(FailurePoint::CreateAnswer));
    assert!(world.connect(&identity));
    assert_eq!(world.alice.router.phase(&identity), None);
    assert_eq!(world.bob.router.phase(&identity), None);

    world.bob.transports.fail_at(None);
    assert!(world.connect(&identity));
    assert_eq!(
        world.alice.router.phase(&identity),
        Some(SessionPhase::Connected),
    );
    assert_eq!(
        world.bob.router.phase(&identity),
        Some(SessionPhase::Connected),
    );
}

#[test]
fn offer_failure_is_reported() {
    let mut world = World::new();
    let identity = identity();

    world.alice.transports.fail_at(Some(FailurePoint::CreateOffer));
    assert!(!world.connect(&identity));
    assert_eq!(world.alice.router.phase(&identity), None);
    assert_eq!(world.bob.router.phase(&identity), None);
}

#[test]
fn signalling_loss_closes_sessions() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));
    let alice_session = world.alice.router.session(&identity).unwrap();
    let bob_session = world.bob.router.session(&identity).unwrap();

    world.relay.disconnect();
    world.settle();

    assert_eq!(world.alice.router.phase(&identity), None);
    assert_eq!(world.bob.router.phase(&identity), None);
    for session in &[alice_session, bob_session] {
        assert!(matches!(
            session.close_reason(),
            Some(CloseReason::SignallingLost | CloseReason::TransportClosed),
        ));
    }
    assert!(world
        .alice
        .router
        .send_system_command(&identity, SystemCommand::CallTimeout)
        .is_none());
}

#[test]
fn dispose_closes_sessions_and_stops_routing() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.connect(&identity));

    world.alice.router.dispose();
    world.settle();

    assert_eq!(world.alice.router.phase(&identity), None);
    assert_eq!(world.bob.router.phase(&identity), None);

    assert!(world
        .bob
        .router
        .send_system_command(&identity.reversed(), SystemCommand::CallBusy)
        .is_some());
    world.settle();
    assert!(world.alice.commands.borrow().is_empty());
}

#[test]
fn phase_changes_are_observable() {
    let mut world = World::new();
    let identity = identity();
    assert!(world.pool.run_until(world.alice.router.connect(&identity)));
    let session = world.alice.router.session(&identity).unwrap();
    let phases = session.on_phase_change();

    assert!(world
        .pool
        .run_until(session.when_phase(SessionPhase::Connected)));
    assert!(world.alice.router.disconnect(&identity));

    let phases: Vec<_> = world.pool.run_until(
        phases
            .take_while(|p| future::ready(*p != SessionPhase::Closed))
            .collect(),
    );
    assert!(phases.ends_with(&[
        SessionPhase::Connected,
        SessionPhase::Closing,
    ]));
    assert_eq!(session.phase(), SessionPhase::Closed);
}
