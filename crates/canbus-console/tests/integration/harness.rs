//! Test harness: one target node serving a console port, plus any number of
//! client transports, all on one `SimBus` with their delivery loops running.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use canbus_console::{Console, ConsoleError, ConsoleEvent, ConsoleHandle, ConsoleOptions, ConsoleState};
use canbus_objects::handlers::{BreakObject, ForceDisconnectObject};
use canbus_objects::{ConsolePort, Dispatcher};
use canbus_protocol::{objects, ExtHeader, NodeAddress, Packet, PacketType, Payload};
use canbus_storage::MemoryProperties;
use canbus_transport::{Session, SimBus, Transport, TransportConfig};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

pub const TARGET: NodeAddress = NodeAddress::new(0, 0, 2);

pub struct TestBus {
    pub bus: SimBus,
    pub target: Arc<Transport>,
    pub port: Arc<ConsolePort>,
    pub broke: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
    _dispatcher: Arc<Dispatcher>,
}

#[allow(dead_code)]
impl TestBus {
    pub fn new() -> Self {
        let bus = SimBus::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let config = TransportConfig::default();
        let target = bus.attach(TARGET, &config);
        let port = ConsolePort::new(
            target.clone(),
            Arc::new(MemoryProperties::new()),
            1024,
            Duration::from_millis(500),
        );
        let mut dispatcher = Dispatcher::new();
        dispatcher.attach_console(port.clone());
        let broke = Arc::new(AtomicBool::new(false));
        let flag = broke.clone();
        dispatcher.register(
            objects::BREAK,
            Arc::new(BreakObject::new(move || flag.store(true, Ordering::SeqCst))),
        );
        let dispatcher = Arc::new(dispatcher);
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        target.attach_dispatcher(weak);
        tokio::spawn(target.clone().run(shutdown_tx.subscribe()));
        Self {
            bus,
            target,
            port,
            broke,
            shutdown_tx,
            _dispatcher: dispatcher,
        }
    }

    /// Attach a client node with its delivery loop running.
    pub fn client(&self, node: u8) -> Arc<Transport> {
        let transport = self.bus.attach(NodeAddress::new(0, 0, node), &TransportConfig::default());
        tokio::spawn(transport.clone().run(self.shutdown_tx.subscribe()));
        transport
    }

    /// Attach a node that answers force-disconnect notices for consoles it
    /// no longer runs, but never releases the ownership record itself.
    pub fn defunct_owner_node(&self, node: u8) -> (Arc<Transport>, Arc<Dispatcher>) {
        let transport = self.client(node);
        let mut dispatcher = Dispatcher::new();
        dispatcher.register(
            objects::FORCE_DISCONN,
            Arc::new(ForceDisconnectObject::new(transport.clone())),
        );
        let dispatcher = Arc::new(dispatcher);
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        transport.attach_dispatcher(weak);
        (transport, dispatcher)
    }

    /// A session on the target node that sees every request addressed to it.
    pub fn watch_target(&self) -> Session {
        self.target.open_session().unwrap()
    }

    /// Claim the console directly for an identity no client answers for.
    pub fn claim_for(&self, owner: ExtHeader) {
        let mut claim = Packet::new(
            ExtHeader::new(PacketType::Wo, TARGET, objects::CONSOLE_CONNECT),
            Some(Payload::from_ext(&owner)),
        )
        .dest(TARGET.node);
        claim.std.src = owner.node;
        self.bus.inject(claim).unwrap();
    }

    /// Yield until the console owner satisfies `pred`.
    pub async fn wait_owner(&self, pred: impl Fn(&ExtHeader) -> bool) {
        for _ in 0..10_000 {
            if pred(&self.port.owner()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("console owner is still {}", self.port.owner());
    }

    pub fn options(&self) -> ConsoleOptions {
        ConsoleOptions::new(TARGET)
    }

    /// Start a console over a duplex pipe standing in for the terminal.
    pub fn start(&self, client: &Arc<Transport>, options: ConsoleOptions) -> RunningConsole {
        let (events_tx, events) = mpsc::unbounded_channel();
        let console = Console::open(client.open_session().unwrap(), options, events_tx).unwrap();
        let identity = console.identity();
        let handle = console.handle();
        let (keyboard, terminal) = tokio::io::duplex(256);
        let task = tokio::spawn(console.run(terminal));
        RunningConsole {
            identity,
            handle,
            keyboard,
            events,
            task,
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

pub struct RunningConsole {
    pub identity: ExtHeader,
    pub handle: ConsoleHandle,
    pub keyboard: DuplexStream,
    pub events: mpsc::UnboundedReceiver<ConsoleEvent>,
    pub task: JoinHandle<Result<(), ConsoleError>>,
}

#[allow(dead_code)]
impl RunningConsole {
    pub async fn wait_state(&self, want: ConsoleState) {
        let mut watch = self.handle.watch();
        tokio::time::timeout(Duration::from_secs(60), watch.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for console state")
            .expect("console state channel closed");
    }

    pub async fn type_bytes(&mut self, bytes: &[u8]) {
        self.keyboard.write_all(bytes).await.unwrap();
    }

    /// Collect remote output until `want` bytes have arrived.
    pub async fn output(&mut self, want: usize) -> Vec<u8> {
        let mut out = Vec::new();
        while out.len() < want {
            let event = tokio::time::timeout(Duration::from_secs(10), self.events.recv())
                .await
                .expect("timed out waiting for console output")
                .expect("console event channel closed");
            if let ConsoleEvent::Data(bytes) = event {
                out.extend(bytes);
            }
        }
        out
    }

    /// Wait for a notice line containing `text`.
    pub async fn notice(&mut self, text: &str) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(60), self.events.recv())
                .await
                .expect("timed out waiting for notice")
                .expect("console event channel closed");
            if matches!(&event, ConsoleEvent::Notice(line) if line.contains(text)) {
                return;
            }
        }
    }

    pub async fn finish(self) -> Result<(), ConsoleError> {
        tokio::time::timeout(Duration::from_secs(120), self.task)
            .await
            .expect("console did not finish")
            .expect("console task panicked")
    }
}
