//! Heartbeat -- periodic WNA to the board H8, with an IAM announcement
//! every `iam_factor` beats.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use canbus_protocol::{objects, ExtHeader, HeartbeatState, NodeAddress, Packet, PacketType, Payload, RELAY_NODE, TIMING};
use canbus_transport::Transport;
use tokio::sync::broadcast;

/// The value reported in heartbeats: state code shifted left by two.
#[derive(Debug)]
pub struct HeartbeatValue(AtomicU32);

impl HeartbeatValue {
    pub fn new(state: HeartbeatState) -> Self {
        Self(AtomicU32::new(state.value()))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set_state(&self, state: HeartbeatState) {
        self.0.store(state.value(), Ordering::Relaxed);
    }

    pub fn state(&self) -> Option<HeartbeatState> {
        HeartbeatState::from_value(self.get())
    }
}

impl Default for HeartbeatValue {
    fn default() -> Self {
        Self::new(HeartbeatState::default())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub interval: Duration,
    pub iam_factor: u64,
    pub board_type: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: TIMING.heartbeat_interval(),
            iam_factor: TIMING.iam_factor,
            board_type: 0,
        }
    }
}

pub fn heartbeat_packet(local: &NodeAddress, value: u32) -> Packet {
    let h8 = local.board_h8();
    let ext = ExtHeader::new(PacketType::Wna, h8, objects::HEARTBEAT);
    Packet::new(ext, Some(Payload::from_u32(value))).dest(h8.node)
}

/// IAM goes out under the board H8's name, to the module relay.
pub fn iam_packet(local: &NodeAddress, board_type: u32) -> Packet {
    let relay = NodeAddress::new(local.cluster, local.module, RELAY_NODE);
    let ext = ExtHeader::new(PacketType::Wna, relay, objects::IAM);
    let mut pkt = Packet::new(ext, Some(Payload::from_u32(board_type))).dest(RELAY_NODE);
    pkt.std.src = local.board_h8().node;
    pkt
}

pub async fn run_heartbeat_loop(
    transport: Arc<Transport>,
    value: Arc<HeartbeatValue>,
    config: HeartbeatConfig,
    mut shutdown: broadcast::Receiver<()>,
) {
    let local = transport.local_address();
    let mut ticker = tokio::time::interval(config.interval);
    let mut beats: u64 = 0;
    tracing::info!(interval_ms = config.interval.as_millis() as u64, "heartbeat started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = transport.send(heartbeat_packet(&local, value.get())) {
                    tracing::debug!("heartbeat not queued: {e}");
                }
                if config.iam_factor > 0 && beats % config.iam_factor == 0 {
                    if let Err(e) = transport.send_as_is(iam_packet(&local, config.board_type)) {
                        tracing::debug!("IAM not queued: {e}");
                    }
                }
                beats = beats.wrapping_add(1);
            }
            _ = shutdown.recv() => {
                tracing::info!(beats, "heartbeat stopped");
                return;
            }
        }
    }
}
