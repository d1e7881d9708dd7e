//! ACK/NAK staging between a session's receiver and its transaction client.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use canbus_protocol::{Packet, PacketType};
use canbus_transport::Session;
use tokio::sync::{broadcast, Notify};

/// Bounded FIFO of replies waiting for the transaction client to claim
/// them. Only one transaction may be outstanding per session; replies that
/// arrive while none is outstanding are logged and dropped.
pub struct AckStaging {
    records: Mutex<VecDeque<Packet>>,
    capacity: usize,
    arrived: Notify,
    outstanding: AtomicBool,
}

impl AckStaging {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            arrived: Notify::new(),
            outstanding: AtomicBool::new(false),
        }
    }

    fn records(&self) -> MutexGuard<'_, VecDeque<Packet>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stage a reply. Returns false when it was dropped.
    pub fn offer(&self, pkt: Packet) -> bool {
        if !matches!(pkt.ext.kind, PacketType::Ack | PacketType::Nak) {
            return false;
        }
        if !self.outstanding.load(Ordering::Acquire) {
            tracing::warn!(src = pkt.std.src, ext = %pkt.ext, "unexpected {} with no transaction outstanding", pkt.ext.kind);
            return false;
        }
        {
            let mut records = self.records();
            if records.len() >= self.capacity {
                tracing::debug!(ext = %pkt.ext, "staging full, reply dropped");
                return false;
            }
            records.push_back(pkt);
        }
        self.arrived.notify_one();
        true
    }

    /// Remove and return everything staged, oldest first.
    pub fn take_all(&self) -> Vec<Packet> {
        self.records().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records().is_empty()
    }

    pub(crate) async fn arrived(&self) {
        self.arrived.notified().await
    }

    pub(crate) fn begin(&self) -> Outstanding<'_> {
        self.outstanding.store(true, Ordering::Release);
        Outstanding(self)
    }
}

/// Marks a transaction in flight; clears the mark when dropped, including
/// when the waiting future is cancelled.
pub(crate) struct Outstanding<'a>(&'a AckStaging);

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.0.outstanding.store(false, Ordering::Release);
    }
}

/// Receive loop for sessions that only run transactions (no console):
/// stages every ACK/NAK and ignores the rest.
pub async fn run_ack_pump(
    session: Arc<Session>,
    staging: Arc<AckStaging>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            pkt = session.recv() => {
                staging.offer(pkt);
            }
            _ = shutdown.recv() => return,
        }
    }
}
