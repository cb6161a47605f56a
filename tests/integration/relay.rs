use peerlink::{
    proto::{Direction, MessageKind, SystemCommand},
    Conf,
};

use crate::{identity, World};

#[test]
fn system_command_without_session_uses_relay() {
    let mut world = World::new();
    let identity = identity();

    let sent = world
        .alice
        .router
        .send_system_command(&identity, SystemCommand::InitiateCallConnection)
        .unwrap();
    world.settle();

    assert_eq!(sent.direction, Direction::Out);
    assert_eq!(sent.payload, "initiate-call-connection");
    assert_eq!(world.alice.router.messages(identity.name()), vec![sent]);

    let commands = world.bob.commands.borrow();
    assert_eq!(commands.len(), 1);
    let (message, command) = &commands[0];
    assert_eq!(*command, SystemCommand::InitiateCallConnection);
    assert_eq!(message.kind, MessageKind::SystemCommand);
    assert_eq!(message.direction, Direction::In);
    assert_eq!(message.identity, identity);
    assert_eq!(world.bob.router.messages(identity.name()).len(), 1);
    assert_eq!(world.bob.router.phase(&identity), None);
}

#[test]
fn relay_fallback_can_be_disabled() {
    let mut conf = Conf::default();
    conf.signalling.send_system_commands_via_relay = false;
    let mut world = World::with_conf(&conf);
    let identity = identity();

    assert!(world
        .alice
        .router
        .send_system_command(&identity, SystemCommand::InitiateCallConnection)
        .is_none());
    world.settle();

    assert!(world.alice.router.messages(identity.name()).is_empty());
    assert!(world.bob.commands.borrow().is_empty());

    assert!(world.connect(&identity));
    assert!(world
        .alice
        .router
        .send_system_command(&identity, SystemCommand::MuteVideo)
        .is_some());
    world.settle();

    let commands = world.bob.commands.borrow();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].1, SystemCommand::MuteVideo);
}
