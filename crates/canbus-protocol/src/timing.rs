//! Protocol timing -- the parameters both ends of a transaction agree on.
//!
//! Node-local sizing (ring capacities, session limits) is configuration and
//! lives with the transport, not here.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusTiming {
    // -- Transactions --
    /// Absolute wait per attempt for a correlated ACK/NAK.
    pub ack_deadline_ms: u64,
    /// Pause after a NAK before retransmitting.
    pub nak_backoff_ms: u64,
    /// Attempts for blocking console requests.
    pub max_retries: u32,
    /// Pending ACK/NAK records a session stages between waits.
    pub staging_capacity: usize,

    // -- Console --
    /// Node side: wait for the owner's ACK of a DAT chunk.
    pub console_ack_timeout_ms: u64,
    /// Read polls of the connect object while stealing.
    pub steal_polls: u32,
    /// Delay before each steal poll.
    pub steal_poll_interval_ms: u64,
    /// Locally typed bytes queued for the writer.
    pub input_queue_bytes: usize,

    // -- Heartbeat --
    pub heartbeat_interval_ms: u64,
    /// Heartbeats between IAM announcements.
    pub iam_factor: u64,
}

pub const TIMING: BusTiming = BusTiming {
    ack_deadline_ms: 2_000,
    nak_backoff_ms: 1,
    max_retries: 20,
    staging_capacity: 16,
    console_ack_timeout_ms: 500,
    steal_polls: 5,
    steal_poll_interval_ms: 1,
    input_queue_bytes: 1024,
    heartbeat_interval_ms: 250,
    iam_factor: 0x77,
};

impl BusTiming {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_millis(self.ack_deadline_ms)
    }

    pub fn nak_backoff(&self) -> Duration {
        Duration::from_millis(self.nak_backoff_ms)
    }

    pub fn console_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.console_ack_timeout_ms)
    }

    pub fn steal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.steal_poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}
