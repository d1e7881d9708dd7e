//! Object dispatcher -- object id to handler, handler reply to ACK/NAK.

use std::collections::HashMap;
use std::sync::Arc;

use canbus_protocol::{objects, Packet, Payload};
use canbus_transport::LocalDispatch;

use crate::console_port::{ConnectObject, ConsoleDataObject, ConsolePort, DisconnectObject};

/// A handler's answer to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack(Option<Payload>),
    Nak(Option<Payload>),
    /// Not a request this handler reacts to; send nothing.
    Ignore,
}

pub trait ObjectHandler: Send + Sync {
    fn handle(&self, pkt: &Packet) -> Reply;
}

#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<u16, Arc<dyn ObjectHandler>>,
    console: Option<Arc<ConsolePort>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, object: u16, handler: Arc<dyn ObjectHandler>) -> &mut Self {
        if self.handlers.insert(object, handler).is_some() {
            tracing::warn!(object = format_args!("{object:#05x}"), "object handler replaced");
        }
        self
    }

    /// Install the console objects (connect, disconnect, data) and route the
    /// current owner's object to the port.
    pub fn attach_console(&mut self, port: Arc<ConsolePort>) -> &mut Self {
        self.register(objects::CONSOLE_CONNECT, Arc::new(ConnectObject(port.clone())));
        self.register(objects::CONSOLE_DISCONN, Arc::new(DisconnectObject(port.clone())));
        self.register(objects::CONSOLE_DATA, Arc::new(ConsoleDataObject(port.clone())));
        self.console = Some(port);
        self
    }

    pub fn dispatch(&self, pkt: &Packet) -> Option<Packet> {
        let mut reply = self
            .handlers
            .get(&pkt.ext.object)
            .map_or(Reply::Ignore, |h| h.handle(pkt));

        if let Some(port) = &self.console {
            let owner = port.owner();
            if !owner.is_unconnected() && pkt.ext.object == owner.object {
                reply = port.owner_object(pkt);
            }
        }

        match reply {
            Reply::Ack(payload) => Some(pkt.ack(payload)),
            Reply::Nak(payload) => {
                tracing::debug!(src = pkt.std.src, ext = %pkt.ext, "request refused");
                Some(pkt.nak(payload))
            }
            Reply::Ignore => None,
        }
    }
}

impl LocalDispatch for Dispatcher {
    fn dispatch(&self, pkt: &Packet) -> Option<Packet> {
        Dispatcher::dispatch(self, pkt)
    }
}
