//! Sessions -- per-consumer views of a transport.
//!
//! The transport keeps session state in a slab; callers hold a `Session`
//! whose `SessionId` carries the slot generation, so a handle to a closed
//! and reused slot is detected instead of aliasing the new occupant.

use std::sync::Arc;

use canbus_protocol::{NodeAddress, Packet};

use crate::ring::SharedRing;
use crate::transport::Transport;
use crate::{Result, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    index: usize,
    generation: u32,
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

pub(crate) struct SessionState {
    pub(crate) queue: Arc<SharedRing<Packet>>,
    pub(crate) promiscuous: bool,
    pub(crate) snoopy: bool,
    pub(crate) console_object: Option<u16>,
}

enum Slot {
    Vacant { generation: u32 },
    Occupied { generation: u32, state: SessionState },
}

pub(crate) struct SessionTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    open: usize,
    max: usize,
}

impl SessionTable {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            open: 0,
            max,
        }
    }

    pub(crate) fn insert(&mut self, state: SessionState) -> Result<SessionId> {
        if self.open >= self.max {
            return Err(TransportError::TooManySessions(self.open));
        }
        let reused = self.free.pop().and_then(|index| match self.slots[index] {
            Slot::Vacant { generation } => Some((index, generation)),
            Slot::Occupied { .. } => None,
        });
        let (index, generation) = match reused {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::Vacant { generation: 0 });
                (self.slots.len() - 1, 0)
            }
        };
        self.slots[index] = Slot::Occupied { generation, state };
        self.open += 1;
        Ok(SessionId { index, generation })
    }

    pub(crate) fn get_mut(&mut self, id: SessionId) -> Result<&mut SessionState> {
        match self.slots.get_mut(id.index) {
            Some(Slot::Occupied { generation, state }) if *generation == id.generation => Ok(state),
            _ => Err(TransportError::StaleSession),
        }
    }

    pub(crate) fn remove(&mut self, id: SessionId) -> Option<SessionState> {
        let live = matches!(
            self.slots.get(id.index),
            Some(Slot::Occupied { generation, .. }) if *generation == id.generation
        );
        if !live {
            return None;
        }
        let next = Slot::Vacant {
            generation: id.generation.wrapping_add(1),
        };
        match std::mem::replace(&mut self.slots[id.index], next) {
            Slot::Occupied { state, .. } => {
                self.free.push(id.index);
                self.open -= 1;
                Some(state)
            }
            Slot::Vacant { .. } => None,
        }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SessionState> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Occupied { state, .. } => Some(state),
            Slot::Vacant { .. } => None,
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.open
    }
}

/// An open session. Dropping it closes the session and returns its console
/// object to the pool.
pub struct Session {
    id: SessionId,
    queue: Arc<SharedRing<Packet>>,
    transport: Arc<Transport>,
}

impl Session {
    pub(crate) fn new(id: SessionId, queue: Arc<SharedRing<Packet>>, transport: Arc<Transport>) -> Self {
        Self {
            id,
            queue,
            transport,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn local_address(&self) -> NodeAddress {
        self.transport.local_address()
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    /// Next packet from this session's private queue.
    pub async fn recv(&self) -> Packet {
        self.queue.pop().await
    }

    pub fn try_recv(&self) -> Option<Packet> {
        self.queue.try_pop()
    }

    /// Send with outgoing fixup (source = local node).
    pub fn send(&self, pkt: Packet) -> Result<()> {
        self.transport.send(pkt)
    }

    pub fn set_promiscuous(&self, on: bool) -> Result<()> {
        self.transport.set_promiscuous(self.id, on)
    }

    /// See locally originated traffic to other nodes without opening the
    /// bus accept filter.
    pub fn set_snoopy(&self, on: bool) -> Result<()> {
        self.transport.set_snoopy(self.id, on)
    }

    /// This session's console object, allocated on first use.
    pub fn console_object(&self) -> Result<u16> {
        self.transport.session_console_object(self.id)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.transport.close_session(self.id);
    }
}
