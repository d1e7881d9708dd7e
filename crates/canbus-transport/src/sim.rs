//! In-memory multi-drop bus.
//!
//! Every attached transport sees frames whose destination matches its node
//! id, or all frames while its accept filter is open. Frames go through the
//! bus codec on the way, so malformed packets fail here as they would on a
//! real wire. A sender never hears its own frames.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use bytes::BytesMut;
use canbus_protocol::{BusFrameCodec, NodeAddress, Packet};
use tokio_util::codec::{Decoder, Encoder};

use crate::transport::{Bus, Transport};
use crate::{Result, TransportConfig};

struct Tap {
    node: u8,
    accept_all: Arc<AtomicBool>,
    transport: Weak<Transport>,
}

#[derive(Default)]
struct Wire {
    taps: Mutex<Vec<Tap>>,
    frames: AtomicU64,
}

impl Wire {
    fn carry(&self, frame: &BytesMut, dest: u8, from: Option<&Arc<AtomicBool>>) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let receivers: Vec<Arc<Transport>> = {
            let taps = self.taps.lock().unwrap_or_else(PoisonError::into_inner);
            taps.iter()
                .filter(|t| from.map_or(true, |f| !Arc::ptr_eq(f, &t.accept_all)))
                .filter(|t| t.node == dest || t.accept_all.load(Ordering::Relaxed))
                .filter_map(|t| t.transport.upgrade())
                .collect()
        };
        for receiver in receivers {
            let mut buf = frame.clone();
            match BusFrameCodec.decode(&mut buf) {
                Ok(Some(pkt)) => receiver.receive_from_bus(pkt),
                Ok(None) => {}
                Err(e) => tracing::warn!("sim bus: dropping malformed frame: {e}"),
            }
        }
    }
}

/// Shared wire; cheap to clone.
#[derive(Clone, Default)]
pub struct SimBus {
    wire: Arc<Wire>,
}

struct SimPort {
    node: u8,
    accept_all: Arc<AtomicBool>,
    wire: Arc<Wire>,
}

impl Bus for SimPort {
    fn transmit(&self, pkt: &Packet) -> Result<()> {
        let mut frame = BytesMut::new();
        BusFrameCodec.encode(*pkt, &mut frame)?;
        tracing::trace!(from = self.node, dest = pkt.std.dest, ext = %pkt.ext, "sim bus frame");
        self.wire.carry(&frame, pkt.std.dest, Some(&self.accept_all));
        Ok(())
    }

    fn set_accept_all(&self, on: bool) {
        self.accept_all.store(on, Ordering::Relaxed);
    }
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport for `local` wired to this bus.
    pub fn attach(&self, local: NodeAddress, config: &TransportConfig) -> Arc<Transport> {
        let accept_all = Arc::new(AtomicBool::new(false));
        let port = SimPort {
            node: local.node,
            accept_all: accept_all.clone(),
            wire: self.wire.clone(),
        };
        let transport = Transport::new(local, Arc::new(port), config);
        self.wire
            .taps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Tap {
                node: local.node,
                accept_all,
                transport: Arc::downgrade(&transport),
            });
        transport
    }

    /// Put a frame on the wire as if a node outside the simulation sent it.
    pub fn inject(&self, pkt: Packet) -> Result<()> {
        let mut frame = BytesMut::new();
        BusFrameCodec.encode(pkt, &mut frame)?;
        self.wire.carry(&frame, pkt.std.dest, None);
        Ok(())
    }

    /// Frames carried so far.
    pub fn frames(&self) -> u64 {
        self.wire.frames.load(Ordering::Relaxed)
    }
}
