//! Stock object handlers.

use std::sync::{Arc, Mutex, PoisonError};

use canbus_protocol::{objects, PacketType, Packet, Payload};
use canbus_storage::PropertyStore;
use canbus_transport::Transport;

use crate::dispatcher::{ObjectHandler, Reply};
use crate::heartbeat::HeartbeatValue;
use crate::tables::TableProperty;

// ============================================================================
// Read/write register
// ============================================================================

/// WO answers with the previous value, then commits. RO answers with the
/// current value.
pub struct ReadWriteRegister {
    value: Mutex<u32>,
}

impl ReadWriteRegister {
    pub fn new(initial: u32) -> Self {
        Self {
            value: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> u32 {
        *self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ObjectHandler for ReadWriteRegister {
    fn handle(&self, pkt: &Packet) -> Reply {
        let mut value = self.value.lock().unwrap_or_else(PoisonError::into_inner);
        match pkt.ext.kind {
            PacketType::Ro => Reply::Ack(Some(Payload::from_u32(*value))),
            PacketType::Wo => {
                let old = *value;
                *value = pkt.payload.as_u32();
                Reply::Ack(Some(Payload::from_u32(old)))
            }
            _ => Reply::Ignore,
        }
    }
}

// ============================================================================
// Heartbeat
// ============================================================================

pub struct HeartbeatObject(pub Arc<HeartbeatValue>);

impl ObjectHandler for HeartbeatObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        match pkt.ext.kind {
            PacketType::Ro => Reply::Ack(Some(Payload::from_u32(self.0.get()))),
            _ => Reply::Ignore,
        }
    }
}

// ============================================================================
// Table-backed properties
// ============================================================================

/// A property exposed as its table index. RO reads it. When writable, WO
/// stores the new index into the primary property and every mirror, ACKs
/// the old index, and on any failure NAKs and restores what was written.
pub struct PropertyObject {
    store: Arc<dyn PropertyStore>,
    primary: TableProperty,
    mirrors: Vec<TableProperty>,
    writable: bool,
}

impl PropertyObject {
    pub fn read_only(store: Arc<dyn PropertyStore>, primary: TableProperty) -> Self {
        Self {
            store,
            primary,
            mirrors: Vec::new(),
            writable: false,
        }
    }

    pub fn read_write(
        store: Arc<dyn PropertyStore>,
        primary: TableProperty,
        mirrors: Vec<TableProperty>,
    ) -> Self {
        Self {
            store,
            primary,
            mirrors,
            writable: true,
        }
    }

    fn read_index(&self, prop: &TableProperty) -> Option<u32> {
        match self.store.get(prop.name) {
            Ok(Some(value)) => prop.index_of(&value),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(property = prop.name, "property read failed: {e}");
                None
            }
        }
    }

    fn write_index(&self, prop: &TableProperty, index: u32) -> bool {
        let Some(value) = prop.value_at(index) else {
            return false;
        };
        match self.store.set(prop.name, value) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(property = prop.name, "property write failed: {e}");
                false
            }
        }
    }

    fn write(&self, new: u32) -> Reply {
        let Some(old) = self.read_index(&self.primary) else {
            return Reply::Nak(Some(Payload::from_u32(0)));
        };
        let nak = Reply::Nak(Some(Payload::from_u32(old)));

        let targets: Vec<&TableProperty> = std::iter::once(&self.primary).chain(&self.mirrors).collect();
        let previous: Vec<Option<u32>> = targets.iter().map(|p| self.read_index(p)).collect();

        for (n, prop) in targets.iter().enumerate() {
            if !self.write_index(prop, new) {
                for (undo, before) in targets[..n].iter().zip(&previous) {
                    if let Some(before) = before {
                        self.write_index(undo, *before);
                    }
                }
                return nak;
            }
        }
        tracing::info!(property = self.primary.name, old, new, "property changed over the bus");
        Reply::Ack(Some(Payload::from_u32(old)))
    }
}

impl ObjectHandler for PropertyObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        match pkt.ext.kind {
            PacketType::Ro => match self.read_index(&self.primary) {
                Some(index) => Reply::Ack(Some(Payload::from_u32(index))),
                None => Reply::Nak(Some(Payload::from_u32(0))),
            },
            PacketType::Wo if self.writable => self.write(pkt.payload.as_u32()),
            _ => Reply::Ignore,
        }
    }
}

// ============================================================================
// Break
// ============================================================================

/// WO is acknowledged and then hands control to `action`. The action must
/// not block; it runs on the delivery task.
pub struct BreakObject {
    action: Box<dyn Fn() + Send + Sync>,
}

impl BreakObject {
    pub fn new(action: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            action: Box::new(action),
        }
    }
}

impl ObjectHandler for BreakObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        match pkt.ext.kind {
            PacketType::Wo => {
                tracing::warn!(src = pkt.std.src, "break received");
                (self.action)();
                Reply::Ack(None)
            }
            _ => Reply::Ignore,
        }
    }
}

// ============================================================================
// Force disconnect
// ============================================================================

/// A console client being displaced normally answers the force-disconnect
/// notice itself. When the named console object is not held by any local
/// session the client is gone, so the node answers on its behalf.
pub struct ForceDisconnectObject {
    transport: Arc<Transport>,
}

impl ForceDisconnectObject {
    pub fn new(transport: Arc<Transport>) -> Self {
        Self { transport }
    }
}

impl ObjectHandler for ForceDisconnectObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        if pkt.ext.kind != PacketType::Wo {
            return Reply::Ignore;
        }
        let Ok(console) = pkt.payload.as_ext() else {
            return Reply::Ignore;
        };
        if !objects::is_console_object(console.object)
            || self.transport.console_object_in_use(console.object)
        {
            return Reply::Ignore;
        }
        tracing::info!(object = console.object, "acknowledging force-disconnect for defunct console");
        Reply::Ack(None)
    }
}
