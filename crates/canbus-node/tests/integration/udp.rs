//! Node objects and console traffic over real sockets.

use std::time::Duration;

use canbus_console::{Console, ConsoleEvent, ConsoleOptions, ConsoleState};
use canbus_node::tools::{ctl_request, ping_once};
use canbus_protocol::{objects, PacketType};
use tokio::sync::mpsc;

use crate::harness::{UdpHarness, NODE};

#[tokio::test]
async fn test_ping_over_udp() {
    let h = UdpHarness::start().await;
    let client = h.client(5).await;
    let mut tx = h.transaction_client(&client);

    for seq in 0..3 {
        let reply = ping_once(&mut tx, NODE, seq).await.expect("ping timed out");
        assert!(reply.acked);
        assert!(reply.anomaly().is_none(), "{reply:?}");
    }
    assert_eq!(h.node.testrw.get(), 2);
    h.shutdown();
}

#[tokio::test]
async fn test_ctl_reads_property_object() {
    let h = UdpHarness::start().await;
    let client = h.client(5).await;
    let mut tx = h.transaction_client(&client);

    let request = ctl_request(&client.local_address(), PacketType::Ro, objects::AUTOBOOT, NODE, None);
    let reply = tx.send_and_wait(request, 3).await.into_result().unwrap();
    assert_eq!(reply.payload.as_u32(), 1);
    h.shutdown();
}

#[tokio::test]
async fn test_console_output_reaches_client() {
    let h = UdpHarness::start().await;
    let client = h.client(5).await;
    let session = client.open_session().unwrap();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let console = Console::open(session, ConsoleOptions::new(NODE), events_tx).unwrap();
    let handle = console.handle();
    let identity = console.identity();
    let (_stdin, input) = tokio::io::duplex(64);
    let run = tokio::spawn(console.run(input));

    let mut states = handle.watch();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == ConsoleState::Connected))
        .await
        .expect("console did not connect")
        .unwrap();
    assert_eq!(h.node.port.owner(), identity);

    h.node.port.write_log("login: ");
    let mut seen = Vec::new();
    while seen.len() < 7 {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(ConsoleEvent::Data(bytes))) => seen.extend(bytes),
            Ok(Some(_)) => {}
            other => panic!("console output stalled: {other:?}"),
        }
    }
    assert_eq!(seen, b"login: ");

    handle.disconnect();
    run.await.unwrap().unwrap();
    assert!(!h.node.port.is_connected());
    h.shutdown();
}
