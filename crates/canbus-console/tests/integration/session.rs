//! Steady-state console traffic.

use std::sync::atomic::Ordering;
use std::time::Duration;

use canbus_console::ConsoleState;
use tokio::time::Instant;

use crate::harness::TestBus;

async fn read_port(bus: &TestBus, want: usize) -> Vec<u8> {
    let mut typed = Vec::new();
    while typed.len() < want {
        let b = tokio::time::timeout(Duration::from_secs(10), bus.port.read())
            .await
            .expect("timed out waiting for console input");
        typed.push(b);
    }
    typed
}

#[tokio::test(start_paused = true)]
async fn test_bytes_flow_both_ways() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let mut console = bus.start(&client, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    console.type_bytes(b"uname -a\r").await;
    assert_eq!(read_port(&bus, 9).await, b"uname -a\r");

    assert_eq!(bus.port.write_log("ok\n"), 4);
    assert_eq!(console.output(4).await, b"ok\r\n");

    console.handle.disconnect();
    console.finish().await.unwrap();
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_help_escape_sends_nothing() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let mut console = bus.start(&client, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    console.type_bytes(b"\r&?").await;
    console.notice("& .  disconnect").await;
    console.type_bytes(b"\r&&").await;
    assert_eq!(read_port(&bus, 4).await, b"\r\r&&");

    console.handle.disconnect();
    console.finish().await.unwrap();
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_break_and_reset_commands() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let mut console = bus.start(&client, bus.options());
    console.wait_state(ConsoleState::Connected).await;

    console.type_bytes(b"\r&#").await;
    console.notice("Sent break.").await;
    assert!(bus.broke.load(Ordering::SeqCst));

    console.type_bytes(b"\r&r").await;
    console.notice("cannot reset H8").await;

    console.handle.disconnect();
    console.finish().await.unwrap();
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_does_not_wait_for_pending_reset() {
    let bus = TestBus::new();
    let client = bus.client(5);
    let mut options = bus.options();
    // Nothing on the bus answers for the board H8.
    options.reset_object = Some(0x123);
    let mut console = bus.start(&client, options);
    console.wait_state(ConsoleState::Connected).await;

    console.type_bytes(b"\r&r").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    console.handle.disconnect();
    console.finish().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1), "took {:?}", started.elapsed());
    assert!(!bus.port.is_connected());
    bus.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_live_owner_is_told_it_was_stolen() {
    let bus = TestBus::new();
    let victim_node = bus.client(5);
    let mut victim = bus.start(&victim_node, bus.options());
    victim.wait_state(ConsoleState::Connected).await;

    let thief_node = bus.client(6);
    let mut options = bus.options();
    options.steal = true;
    let thief = bus.start(&thief_node, options);

    victim.notice("Console has been stolen!").await;
    victim.finish().await.unwrap();
    thief.wait_state(ConsoleState::Connected).await;
    bus.wait_owner(|o| *o == thief.identity).await;

    thief.handle.disconnect();
    thief.finish().await.unwrap();
    bus.shutdown();
}
