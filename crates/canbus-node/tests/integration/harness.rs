//! Test harness: one node served on a loopback UDP bus, plus client
//! stations that list the node as their only peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use canbus_console::{run_ack_pump, AckStaging, TransactionClient, TransactionPolicy};
use canbus_node::node::{Node, NodeSettings};
use canbus_node::udp_bus::UdpBus;
use canbus_protocol::NodeAddress;
use canbus_storage::MemoryProperties;
use canbus_transport::{Transport, TransportConfig};
use tokio::sync::broadcast;

pub const NODE: NodeAddress = NodeAddress::new(0, 0, 2);

pub struct UdpHarness {
    pub node: Node,
    pub node_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
}

#[allow(dead_code)]
impl UdpHarness {
    pub async fn start() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let bus = UdpBus::bind("127.0.0.1:0", &[]).await.unwrap();
        let node_addr = bus.local_addr().unwrap();
        let receiver = bus.receiver();
        let transport = Transport::new(NODE, Arc::new(bus), &TransportConfig::default());
        tokio::spawn(receiver.run(transport.clone(), shutdown_tx.subscribe()));

        let settings = NodeSettings {
            heartbeat: None,
            ..NodeSettings::default()
        };
        let node = Node::build(transport, Arc::new(MemoryProperties::new()), settings).unwrap();
        node.spawn(&shutdown_tx);
        Self {
            node,
            node_addr,
            shutdown_tx,
        }
    }

    /// A client station whose only configured peer is the node.
    pub async fn client(&self, node: u8) -> Arc<Transport> {
        let bus = UdpBus::bind("127.0.0.1:0", &[self.node_addr.to_string()])
            .await
            .unwrap();
        let receiver = bus.receiver();
        let transport = Transport::new(NodeAddress::new(0, 0, node), Arc::new(bus), &TransportConfig::default());
        tokio::spawn(receiver.run(transport.clone(), self.shutdown_tx.subscribe()));
        tokio::spawn(transport.clone().run(self.shutdown_tx.subscribe()));
        transport
    }

    pub fn transaction_client(&self, transport: &Arc<Transport>) -> TransactionClient {
        let session = Arc::new(transport.open_session().unwrap());
        let staging = Arc::new(AckStaging::new(16));
        tokio::spawn(run_ack_pump(session.clone(), staging.clone(), self.shutdown_tx.subscribe()));
        TransactionClient::new(
            session,
            staging,
            TransactionPolicy {
                deadline: Duration::from_secs(1),
                nak_backoff: Duration::from_millis(10),
            },
        )
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
