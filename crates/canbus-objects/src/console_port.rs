//! Console port -- the node side of a remote console.
//!
//! The owner is persisted as the "cancon-host" property so a restart keeps
//! the connection. Output is forwarded to the owner in DAT chunks of up to
//! four bytes with a single chunk in flight; a chunk that is not ACKed
//! within the ack timeout is abandoned and the next one goes out.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use canbus_protocol::{ExtHeader, PacketType, Packet, Payload, MAX_PAYLOAD};
use canbus_storage::{names, PropertyStore};
use canbus_transport::{RingQueue, SharedRing, Transport};
use tokio::sync::watch;

use crate::dispatcher::{ObjectHandler, Reply};

struct PortState {
    owner: ExtHeader,
    output: RingQueue<u8>,
    ack_pending: bool,
    /// Sequence of the chunk in flight; a timer only fires for its own chunk.
    chunk: u64,
}

pub struct ConsolePort {
    me: Weak<ConsolePort>,
    transport: Arc<Transport>,
    store: Arc<dyn PropertyStore>,
    ack_timeout: Duration,
    state: Mutex<PortState>,
    input: SharedRing<u8>,
    hangups: watch::Sender<u64>,
}

fn load_owner(store: &dyn PropertyStore) -> ExtHeader {
    let raw = match store.get(names::CANCON_HOST) {
        Ok(Some(raw)) => raw,
        Ok(None) => return ExtHeader::unconnected(),
        Err(e) => {
            tracing::warn!("cannot read console owner: {e}");
            return ExtHeader::unconnected();
        }
    };
    match raw.trim().parse::<u32>().map(ExtHeader::unpack) {
        Ok(Ok(owner)) => owner,
        _ => {
            tracing::warn!(value = %raw, "ignoring malformed console owner record");
            ExtHeader::unconnected()
        }
    }
}

impl ConsolePort {
    pub fn new(
        transport: Arc<Transport>,
        store: Arc<dyn PropertyStore>,
        buffer_bytes: usize,
        ack_timeout: Duration,
    ) -> Arc<Self> {
        let owner = load_owner(store.as_ref());
        if !owner.is_unconnected() {
            tracing::info!(owner = %owner, "console owner restored");
        }
        let (hangups, _) = watch::channel(0);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            transport,
            store,
            ack_timeout,
            state: Mutex::new(PortState {
                owner,
                output: RingQueue::new(buffer_bytes),
                ack_pending: false,
                chunk: 0,
            }),
            input: SharedRing::new(buffer_bytes),
            hangups,
        })
    }

    fn state(&self) -> MutexGuard<'_, PortState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn owner(&self) -> ExtHeader {
        self.state().owner
    }

    pub fn is_connected(&self) -> bool {
        !self.owner().is_unconnected()
    }

    fn persist(&self, owner: &ExtHeader) {
        let value = owner.pack().to_string();
        if let Err(e) = self.store.set(names::CANCON_HOST, &value) {
            tracing::warn!("cannot persist console owner: {e}");
        }
    }

    // ========================================================================
    // Bus-facing objects
    // ========================================================================

    /// RO reports the owner. WO claims the console when it is free.
    pub fn connect(&self, pkt: &Packet) -> Reply {
        match pkt.ext.kind {
            PacketType::Ro => Reply::Ack(Some(Payload::from_ext(&self.owner()))),
            PacketType::Wo => {
                let mut state = self.state();
                if !state.owner.is_unconnected() {
                    return Reply::Nak(Some(Payload::from_ext(&state.owner)));
                }
                let Ok(owner) = pkt.payload.as_ext() else {
                    return Reply::Nak(None);
                };
                state.owner = owner;
                state.output.clear();
                drop(state);

                self.persist(&owner);
                tracing::info!(owner = %owner, "console connected");
                Reply::Ack(Some(Payload::from_ext(&owner)))
            }
            _ => Reply::Ignore,
        }
    }

    /// WO releases the console, whoever asks.
    pub fn disconnect(&self, pkt: &Packet) -> Reply {
        if pkt.ext.kind != PacketType::Wo {
            return Reply::Ignore;
        }
        let old = {
            let mut state = self.state();
            if state.owner.is_unconnected() {
                return Reply::Nak(None);
            }
            std::mem::replace(&mut state.owner, ExtHeader::unconnected())
        };
        self.persist(&ExtHeader::unconnected());
        self.hangup();
        tracing::info!(owner = %old, src = pkt.std.src, "console disconnected");
        Reply::Ack(None)
    }

    /// Typed bytes from the owner.
    pub fn receive_data(&self, pkt: &Packet) -> Reply {
        if pkt.ext.kind != PacketType::Dat || !self.is_connected() {
            return Reply::Ignore;
        }
        let data = pkt.data();
        let queued = self.input.push_all(data.iter().copied());
        if queued < data.len() {
            tracing::debug!(dropped = data.len() - queued, "console input full");
        }
        Reply::Ack(None)
    }

    /// Replies arriving on the owner's object answer our DAT chunks.
    pub fn owner_object(&self, pkt: &Packet) -> Reply {
        match pkt.ext.kind {
            PacketType::Ack => self.on_ack(),
            PacketType::Nak => tracing::debug!(ext = %pkt.ext, "owner refused console output"),
            _ => {}
        }
        Reply::Ignore
    }

    // ========================================================================
    // Local side
    // ========================================================================

    /// Queue output for the owner. Output written while nobody is connected
    /// is discarded. Returns the number of bytes accepted.
    pub fn write(&self, bytes: &[u8]) -> usize {
        let mut state = self.state();
        if state.owner.is_unconnected() {
            return 0;
        }
        let mut accepted = 0;
        for &b in bytes {
            if state.output.push(b).is_err() {
                break;
            }
            accepted += 1;
        }
        self.send_next(&mut state);
        accepted
    }

    /// Write a log line, translating newlines for the remote terminal.
    pub fn write_log(&self, text: &str) -> usize {
        self.write(text.replace('\n', "\r\n").as_bytes())
    }

    pub async fn read(&self) -> u8 {
        self.input.pop().await
    }

    pub fn try_read(&self) -> Option<u8> {
        self.input.try_pop()
    }

    /// Bumped on every hangup.
    pub fn subscribe_hangup(&self) -> watch::Receiver<u64> {
        self.hangups.subscribe()
    }

    /// Drop buffered data in both directions and tell readers the line
    /// went away.
    pub fn hangup(&self) {
        {
            let mut state = self.state();
            state.output.clear();
            state.ack_pending = false;
            state.chunk += 1;
        }
        self.input.clear();
        self.hangups.send_modify(|n| *n += 1);
    }

    fn send_next(&self, state: &mut PortState) {
        if state.ack_pending || state.owner.is_unconnected() || state.output.is_empty() {
            return;
        }
        let mut chunk = Vec::with_capacity(MAX_PAYLOAD);
        while chunk.len() < MAX_PAYLOAD {
            match state.output.pop() {
                Some(b) => chunk.push(b),
                None => break,
            }
        }

        let local = self.transport.local_address();
        let owner = state.owner;
        let pkt = Packet::with_data(owner.with_kind(PacketType::Dat), &chunk)
            .dest(local.next_hop(&owner.address()));
        if let Err(e) = self.transport.send(pkt) {
            tracing::debug!(owner = %owner, "console output chunk lost: {e}");
        }

        state.chunk += 1;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        state.ack_pending = true;
        let seq = state.chunk;
        let me = self.me.clone();
        let timeout = self.ack_timeout;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(port) = me.upgrade() {
                port.on_ack_timeout(seq);
            }
        });
    }

    fn on_ack(&self) {
        let mut state = self.state();
        if !state.ack_pending {
            tracing::warn!("unexpected ACK on console object");
            return;
        }
        state.ack_pending = false;
        self.send_next(&mut state);
    }

    fn on_ack_timeout(&self, chunk: u64) {
        let mut state = self.state();
        if !state.ack_pending || state.chunk != chunk {
            return;
        }
        tracing::debug!(owner = %state.owner, "console chunk not acknowledged, moving on");
        state.ack_pending = false;
        self.send_next(&mut state);
    }
}

// ============================================================================
// Handlers
// ============================================================================

pub(crate) struct ConnectObject(pub(crate) Arc<ConsolePort>);
pub(crate) struct DisconnectObject(pub(crate) Arc<ConsolePort>);
pub(crate) struct ConsoleDataObject(pub(crate) Arc<ConsolePort>);

impl ObjectHandler for ConnectObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        self.0.connect(pkt)
    }
}

impl ObjectHandler for DisconnectObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        self.0.disconnect(pkt)
    }
}

impl ObjectHandler for ConsoleDataObject {
    fn handle(&self, pkt: &Packet) -> Reply {
        self.0.receive_data(pkt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Dispatcher;
    use canbus_protocol::{objects, NodeAddress};
    use canbus_storage::MemoryProperties;
    use canbus_transport::{Session, SimBus, TransportConfig};

    const NODE: NodeAddress = NodeAddress::new(0, 0, 2);
    const CLIENT: NodeAddress = NodeAddress::new(0, 0, 5);

    struct Rig {
        node: Arc<Transport>,
        client: Arc<Transport>,
        session: Session,
        port: Arc<ConsolePort>,
        store: Arc<MemoryProperties>,
        _dispatcher: Arc<Dispatcher>,
    }

    fn rig() -> Rig {
        let bus = SimBus::new();
        let node = bus.attach(NODE, &TransportConfig::default());
        let client = bus.attach(CLIENT, &TransportConfig::default());
        let session = client.open_session().unwrap();
        let store = Arc::new(MemoryProperties::new());
        let port = ConsolePort::new(node.clone(), store.clone(), 1024, Duration::from_millis(500));
        let mut dispatcher = Dispatcher::new();
        dispatcher.attach_console(port.clone());
        let dispatcher = Arc::new(dispatcher);
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        node.attach_dispatcher(weak);
        Rig {
            node,
            client,
            session,
            port,
            store,
            _dispatcher: dispatcher,
        }
    }

    impl Rig {
        fn identity(&self) -> ExtHeader {
            let object = self.session.console_object().unwrap();
            ExtHeader::new(PacketType::Dat, CLIENT, object)
        }

        fn request(&self, kind: PacketType, object: u16, payload: Option<Payload>) -> Packet {
            let mut pkt = Packet::new(ExtHeader::new(kind, NODE, object), payload).dest(NODE.node);
            pkt.std.src = CLIENT.node;
            pkt
        }

        fn pump(&self) -> Vec<Packet> {
            while self.node.process_pending() + self.client.process_pending() > 0 {}
            std::iter::from_fn(|| self.session.try_recv()).collect()
        }

        fn claim(&self) {
            let claim = self.request(PacketType::Wo, objects::CONSOLE_CONNECT, Some(Payload::from_ext(&self.identity())));
            assert!(matches!(self.port.connect(&claim), Reply::Ack(_)));
        }
    }

    #[test]
    fn test_connect_claims_and_persists() {
        let rig = rig();
        let ro = rig.request(PacketType::Ro, objects::CONSOLE_CONNECT, None);
        let Reply::Ack(Some(owner)) = rig.port.connect(&ro) else {
            panic!("RO connect must ACK");
        };
        assert!(owner.as_ext().unwrap().is_unconnected());

        rig.claim();
        assert_eq!(rig.port.owner(), rig.identity());
        let stored = rig.store.get(names::CANCON_HOST).unwrap().unwrap();
        assert_eq!(stored, rig.identity().pack().to_string());

        let other = ExtHeader::new(PacketType::Dat, NodeAddress::new(0, 0, 7), 0x150);
        let second = rig.request(PacketType::Wo, objects::CONSOLE_CONNECT, Some(Payload::from_ext(&other)));
        assert_eq!(rig.port.connect(&second), Reply::Nak(Some(Payload::from_ext(&rig.identity()))));
        assert_eq!(rig.port.owner(), rig.identity());
    }

    #[test]
    fn test_owner_restored_from_store() {
        let rig = rig();
        rig.claim();
        let again = ConsolePort::new(rig.node.clone(), rig.store.clone(), 64, Duration::from_millis(500));
        assert_eq!(again.owner(), rig.identity());
    }

    #[test]
    fn test_disconnect_clears_owner_and_hangs_up() {
        let rig = rig();
        let disc = rig.request(PacketType::Wo, objects::CONSOLE_DISCONN, None);
        assert_eq!(rig.port.disconnect(&disc), Reply::Nak(None));

        rig.claim();
        let mut hangups = rig.port.subscribe_hangup();
        assert_eq!(rig.port.disconnect(&disc), Reply::Ack(None));
        assert!(!rig.port.is_connected());
        assert!(hangups.has_changed().unwrap());
        let stored: u32 = rig.store.get(names::CANCON_HOST).unwrap().unwrap().parse().unwrap();
        assert!(ExtHeader::unpack(stored).unwrap().is_unconnected());
    }

    #[test]
    fn test_data_only_accepted_when_connected() {
        let rig = rig();
        let dat = Packet::with_data(ExtHeader::new(PacketType::Dat, NODE, objects::CONSOLE_DATA), b"ls\r");
        assert_eq!(rig.port.receive_data(&dat), Reply::Ignore);

        rig.claim();
        assert_eq!(rig.port.receive_data(&dat), Reply::Ack(None));
        let typed: Vec<u8> = std::iter::from_fn(|| rig.port.try_read()).collect();
        assert_eq!(typed, b"ls\r");
    }

    #[test]
    fn test_output_discarded_when_unconnected() {
        let rig = rig();
        assert_eq!(rig.port.write(b"boot"), 0);
        assert!(rig.pump().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_chunk_in_flight_until_acked() {
        let rig = rig();
        rig.claim();
        assert_eq!(rig.port.write_log("ok\nboot\n"), 10);

        let first = rig.pump();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].ext, rig.identity());
        assert_eq!(first[0].data(), b"ok\r\n");

        // The owner's ACK arrives on its own console object.
        rig.session.send(first[0].ack(None)).unwrap();
        let second = rig.pump();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].data(), b"boot");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_chunk_abandoned_after_timeout() {
        let rig = rig();
        rig.claim();
        rig.port.write(b"abcdefgh");
        assert_eq!(rig.pump()[0].data(), b"abcd");

        tokio::time::sleep(Duration::from_millis(499)).await;
        assert!(rig.pump().is_empty());
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert_eq!(rig.pump()[0].data(), b"efgh");
    }
}
