//! Transport -- inbound/outbound rings, loopback, mirroring and fan-out.
//!
//! Send path:
//!   dest == local node  -> inbound ring (loopback)
//!   otherwise           -> outbound ring, then mirrored into inbound so
//!                          snooping sessions see locally originated traffic
//!
//! Delivery (one packet at a time, on the task running `run`):
//!   1. packets for the local node go to the dispatcher; its reply is sent
//!   2. the packet is copied to every session queue, except that packets
//!      for other nodes only reach promiscuous or snoopy sessions
//!
//! All queues are lossy. Reliability is the transaction client's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Instant;

use canbus_protocol::{NodeAddress, Packet};
use serde::Serialize;
use tokio::sync::{broadcast, Notify};

use crate::pool::ConsoleObjectPool;
use crate::ring::SharedRing;
use crate::session::{Session, SessionId, SessionState, SessionTable};
use crate::{Result, TransportConfig, TransportError};

/// The physical side of a transport.
pub trait Bus: Send + Sync {
    /// Put one frame on the wire. Must not block.
    fn transmit(&self, pkt: &Packet) -> Result<()>;

    /// Open (or close) the receive filter to frames for other nodes.
    fn set_accept_all(&self, on: bool);
}

/// Handler for packets addressed to the local node. Returns at most one
/// reply, which the transport sends.
pub trait LocalDispatch: Send + Sync {
    fn dispatch(&self, pkt: &Packet) -> Option<Packet>;
}

#[derive(Debug, Default)]
struct Counters {
    transmitted: AtomicU64,
    received: AtomicU64,
    delivered: AtomicU64,
    replies: AtomicU64,
    dropped_inbound: AtomicU64,
    dropped_outbound: AtomicU64,
    dropped_session: AtomicU64,
    bus_errors: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub transmitted: u64,
    pub received: u64,
    pub delivered: u64,
    pub replies: u64,
    pub dropped_inbound: u64,
    pub dropped_outbound: u64,
    pub dropped_session: u64,
    pub bus_errors: u64,
    pub open_sessions: usize,
}

struct Sessions {
    table: SessionTable,
    promiscuous: usize,
}

pub struct Transport {
    local: NodeAddress,
    bus: Arc<dyn Bus>,
    dispatcher: RwLock<Option<Weak<dyn LocalDispatch>>>,
    wake: Arc<Notify>,
    inbound: SharedRing<Packet>,
    outbound: SharedRing<Packet>,
    sessions: Mutex<Sessions>,
    console_objects: Mutex<ConsoleObjectPool>,
    session_slots: usize,
    epoch: Instant,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport {
    pub fn new(local: NodeAddress, bus: Arc<dyn Bus>, config: &TransportConfig) -> Arc<Self> {
        let wake = Arc::new(Notify::new());
        Arc::new(Self {
            local,
            bus,
            dispatcher: RwLock::new(None),
            inbound: SharedRing::with_notify(config.inbound_slots, wake.clone()),
            outbound: SharedRing::with_notify(config.outbound_slots, wake.clone()),
            wake,
            sessions: Mutex::new(Sessions {
                table: SessionTable::new(config.max_sessions),
                promiscuous: 0,
            }),
            console_objects: Mutex::new(ConsoleObjectPool::new()),
            session_slots: config.session_slots,
            epoch: Instant::now(),
            counters: Counters::default(),
        })
    }

    pub fn local_address(&self) -> NodeAddress {
        self.local
    }

    /// Attach the local object dispatcher. The transport keeps a weak
    /// reference; the caller owns the dispatcher.
    pub fn attach_dispatcher(&self, dispatcher: Weak<dyn LocalDispatch>) {
        *self
            .dispatcher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);
    }

    fn dispatcher(&self) -> Option<Arc<dyn LocalDispatch>> {
        self.dispatcher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    // ========================================================================
    // Send / receive
    // ========================================================================

    /// Send from this node: source becomes the local node id.
    pub fn send(&self, mut pkt: Packet) -> Result<()> {
        pkt.std.src = self.local.node;
        pkt.std.remote = false;
        self.send_as_is(pkt)
    }

    /// Send without touching the source field (used to speak for another
    /// node, e.g. IAM on behalf of the board H8).
    pub fn send_as_is(&self, mut pkt: Packet) -> Result<()> {
        pkt.timestamp = self.now_ms();

        if pkt.std.dest == self.local.node {
            return self.inbound.push(pkt).map_err(|_| {
                bump(&self.counters.dropped_inbound);
                TransportError::QueueFull
            });
        }

        if self.outbound.push(pkt).is_err() {
            bump(&self.counters.dropped_outbound);
            tracing::debug!(dest = pkt.std.dest, ext = %pkt.ext, "outbound ring full");
            return Err(TransportError::QueueFull);
        }
        if self.inbound.push(pkt).is_err() {
            bump(&self.counters.dropped_inbound);
        }
        Ok(())
    }

    /// Entry point for frames arriving from the bus.
    pub fn receive_from_bus(&self, mut pkt: Packet) {
        pkt.timestamp = self.now_ms();
        bump(&self.counters.received);
        if self.inbound.push(pkt).is_err() {
            bump(&self.counters.dropped_inbound);
            tracing::debug!(src = pkt.std.src, ext = %pkt.ext, "inbound ring full, frame dropped");
        }
    }

    fn transmit(&self, pkt: Packet) {
        match self.bus.transmit(&pkt) {
            Ok(()) => bump(&self.counters.transmitted),
            Err(e) => {
                bump(&self.counters.bus_errors);
                tracing::warn!(dest = pkt.std.dest, ext = %pkt.ext, "transmit failed: {e}");
            }
        }
    }

    fn deliver(&self, pkt: Packet) {
        let mine = pkt.std.dest == self.local.node;

        if mine {
            if let Some(reply) = self.dispatcher().and_then(|d| d.dispatch(&pkt)) {
                bump(&self.counters.replies);
                if let Err(e) = self.send(reply) {
                    tracing::debug!(ext = %reply.ext, "reply not queued: {e}");
                }
            }
        }

        let sessions = lock(&self.sessions);
        for state in sessions.table.iter() {
            if !mine && !state.promiscuous && !state.snoopy {
                continue;
            }
            if state.queue.push(pkt).is_ok() {
                bump(&self.counters.delivered);
            } else {
                bump(&self.counters.dropped_session);
            }
        }
    }

    /// Drain both rings until empty. Returns the number of packets handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let before = handled;
            while let Some(pkt) = self.outbound.try_pop() {
                self.transmit(pkt);
                handled += 1;
            }
            while let Some(pkt) = self.inbound.try_pop() {
                self.deliver(pkt);
                handled += 1;
            }
            if handled == before {
                return handled;
            }
        }
    }

    /// Run the delivery loop until shutdown. Pending packets are flushed
    /// before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(address = %self.local, "transport started");
        loop {
            self.process_pending();
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.recv() => {
                    self.process_pending();
                    break;
                }
            }
        }
        tracing::info!(address = %self.local, stats = ?self.stats(), "transport stopped");
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    pub fn open_session(self: &Arc<Self>) -> Result<Session> {
        let queue = Arc::new(SharedRing::new(self.session_slots));
        let id = lock(&self.sessions).table.insert(SessionState {
            queue: queue.clone(),
            promiscuous: false,
            snoopy: false,
            console_object: None,
        })?;
        tracing::debug!(session = %id, "session opened");
        Ok(Session::new(id, queue, self.clone()))
    }

    pub(crate) fn close_session(&self, id: SessionId) {
        let removed = {
            let mut sessions = lock(&self.sessions);
            let removed = sessions.table.remove(id);
            if let Some(state) = &removed {
                if state.promiscuous {
                    sessions.promiscuous -= 1;
                    if sessions.promiscuous == 0 {
                        self.bus.set_accept_all(false);
                    }
                }
            }
            removed
        };
        if let Some(object) = removed.and_then(|s| s.console_object) {
            lock(&self.console_objects).release(object);
        }
        tracing::debug!(session = %id, "session closed");
    }

    pub(crate) fn set_promiscuous(&self, id: SessionId, on: bool) -> Result<()> {
        let mut sessions = lock(&self.sessions);
        let state = sessions.table.get_mut(id)?;
        if state.promiscuous == on {
            return Ok(());
        }
        state.promiscuous = on;
        if on {
            sessions.promiscuous += 1;
            if sessions.promiscuous == 1 {
                self.bus.set_accept_all(true);
            }
        } else {
            sessions.promiscuous -= 1;
            if sessions.promiscuous == 0 {
                self.bus.set_accept_all(false);
            }
        }
        Ok(())
    }

    pub(crate) fn set_snoopy(&self, id: SessionId, on: bool) -> Result<()> {
        lock(&self.sessions).table.get_mut(id)?.snoopy = on;
        Ok(())
    }

    pub(crate) fn session_console_object(&self, id: SessionId) -> Result<u16> {
        let mut sessions = lock(&self.sessions);
        let state = sessions.table.get_mut(id)?;
        if let Some(object) = state.console_object {
            return Ok(object);
        }
        let object = lock(&self.console_objects)
            .allocate()
            .ok_or(TransportError::PoolExhausted)?;
        state.console_object = Some(object);
        Ok(object)
    }

    /// Whether a local session currently holds this console object.
    pub fn console_object_in_use(&self, object: u16) -> bool {
        lock(&self.console_objects).is_in_use(object)
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        TransportStats {
            transmitted: load(&c.transmitted),
            received: load(&c.received),
            delivered: load(&c.delivered),
            replies: load(&c.replies),
            dropped_inbound: load(&c.dropped_inbound),
            dropped_outbound: load(&c.dropped_outbound),
            dropped_session: load(&c.dropped_session),
            bus_errors: load(&c.bus_errors),
            open_sessions: lock(&self.sessions).table.len(),
        }
    }
}
