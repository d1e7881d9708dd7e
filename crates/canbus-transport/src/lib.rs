//! Canbus Transport -- ring-queued packet transport with session fan-out.
//!
//! One `Transport` per attached node. Producers (sessions, the local
//! dispatcher, timers, the bus receiver) push into the inbound/outbound
//! rings; a single task drains them, transmitting outbound frames and
//! delivering inbound packets to the dispatcher and to open sessions.

pub mod pool;
pub mod ring;
pub mod session;
pub mod sim;
pub mod transport;

pub use ring::{RingQueue, SharedRing};
pub use session::{Session, SessionId};
pub use sim::SimBus;
pub use transport::{Bus, LocalDispatch, Transport, TransportStats};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("queue full, packet not delivered")]
    QueueFull,
    #[error("session limit reached ({0} open)")]
    TooManySessions(usize),
    #[error("stale session handle")]
    StaleSession,
    #[error("console object pool exhausted")]
    PoolExhausted,
    #[error("bus error: {0}")]
    Bus(String),
    #[error("protocol error: {0}")]
    Protocol(#[from] canbus_protocol::ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Ring sizes and session limits. Ring sizes count slots; one slot of each
/// ring stays empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_ring_slots")]
    pub inbound_slots: usize,
    #[serde(default = "default_ring_slots")]
    pub outbound_slots: usize,
    #[serde(default = "default_ring_slots")]
    pub session_slots: usize,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            inbound_slots: default_ring_slots(),
            outbound_slots: default_ring_slots(),
            session_slots: default_ring_slots(),
            max_sessions: default_max_sessions(),
        }
    }
}

fn default_ring_slots() -> usize {
    1024
}
fn default_max_sessions() -> usize {
    256
}
