//! Connect, steal and disconnect handshakes.

use canbus_console::{ConsoleError, ConsoleState};
use canbus_protocol::{objects, ExtHeader, NodeAddress, PacketType};

use crate::harness::TestBus;

fn absent_owner() -> ExtHeader {
    ExtHeader::new(PacketType::Dat, NodeAddress::new(0, 0, 9), 0x180)
}

#[tokio::test(start_paused = true)]
async fn test_connect_to_free_console_is_one_round_trip() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let before = bus.bus.frames();

    let console = bus.start(&client, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    // RO + ACK, WO + ACK.
    assert_eq!(bus.bus.frames() - before, 4);
    assert_eq!(bus.port.owner(), console.identity);
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_owned_console_refused_without_writing() {
    let bus = TestBus::new();
    bus.claim_for(absent_owner());
    bus.wait_owner(|o| *o == absent_owner()).await;

    let client = bus.client(5);
    let before = bus.bus.frames();
    let console = bus.start(&client, bus.options());
    let result = console.finish().await;

    match result {
        Err(ConsoleError::InUse(owner)) => assert_eq!(owner, absent_owner()),
        other => panic!("expected InUse, got {other:?}"),
    }
    // Only the ownership read and its ACK crossed the bus.
    assert_eq!(bus.bus.frames() - before, 2);
    assert_eq!(bus.port.owner(), absent_owner());
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_steal_from_unresponsive_owner() {
    let bus = TestBus::new();
    bus.claim_for(absent_owner());
    bus.wait_owner(|o| *o == absent_owner()).await;

    let client = bus.client(5);
    let mut options = bus.options();
    options.steal = true;
    let console = bus.start(&client, options);
    console.wait_state(ConsoleState::Connected).await;

    assert_eq!(bus.port.owner(), console.identity);
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_steal_forces_disconnect_after_polls() {
    let bus = TestBus::new();
    let (_defunct, _dispatcher) = bus.defunct_owner_node(9);
    bus.claim_for(absent_owner());
    bus.wait_owner(|o| *o == absent_owner()).await;
    let watch = bus.watch_target();

    let client = bus.client(5);
    let mut options = bus.options();
    options.steal = true;
    let console = bus.start(&client, options);
    console.wait_state(ConsoleState::Connected).await;
    assert_eq!(bus.port.owner(), console.identity);

    let requests: Vec<_> = std::iter::from_fn(|| watch.try_recv()).collect();
    let count = |kind: PacketType, object: u16| {
        requests
            .iter()
            .filter(|p| p.ext.kind == kind && p.ext.object == object)
            .count()
    };
    // The ownership read, then every poll, then one forced release.
    assert_eq!(count(PacketType::Ro, objects::CONSOLE_CONNECT), 1 + 5);
    assert_eq!(count(PacketType::Wo, objects::CONSOLE_DISCONN), 1);
    assert_eq!(count(PacketType::Wo, objects::CONSOLE_CONNECT), 1);
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_frees_console_for_next_client() {
    let bus = TestBus::new();
    let first = bus.client(5);
    let mut console = bus.start(&first, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    console.type_bytes(b"\r&.").await;
    let handle = console.handle.clone();
    console.finish().await.unwrap();
    assert_eq!(handle.state(), ConsoleState::Disconnected);
    assert!(!bus.port.is_connected());

    let second = bus.client(6);
    let next = bus.start(&second, bus.options());
    next.wait_state(ConsoleState::Connected).await;
    assert_eq!(bus.port.owner(), next.identity);
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_handle_disconnect() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let console = bus.start(&client, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    console.handle.disconnect();
    console.finish().await.unwrap();
    assert!(!bus.port.is_connected());
    bus.shutdown();
}
