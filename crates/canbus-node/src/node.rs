//! Node services -- everything `serve` runs on top of one transport.
//!
//! The dispatcher answers the node's objects; the console port carries the
//! local console to whichever client owns it; the heartbeat loop announces
//! the node to its board H8.

use std::sync::{Arc, Weak};
use std::time::Duration;

use canbus_objects::handlers::{
    BreakObject, ForceDisconnectObject, HeartbeatObject, PropertyObject, ReadWriteRegister,
};
use canbus_objects::tables::{self, TableProperty};
use canbus_objects::{run_heartbeat_loop, ConsolePort, Dispatcher, HeartbeatConfig, HeartbeatValue};
use canbus_protocol::{objects, HeartbeatState};
use canbus_storage::{names, PropertyStore};
use canbus_transport::Transport;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::CanbusConfig;

/// Property values written on first start.
pub const PROPERTY_DEFAULTS: &[(&str, &str)] = &[
    (names::AUTO_BOOT, "true"),
    (names::BOOT_DEVICE, "disk"),
    (names::BOOT_FILE, ""),
    (names::INPUT_DEVICE, "keyboard"),
    (names::OUTPUT_DEVICE, "screen"),
];

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub output_buffer_bytes: usize,
    pub chunk_ack_timeout: Duration,
    pub heartbeat: Option<HeartbeatConfig>,
    pub initial_state: HeartbeatState,
}

impl NodeSettings {
    pub fn from_config(cfg: &CanbusConfig) -> anyhow::Result<Self> {
        let initial_state = HeartbeatState::from_code(cfg.heartbeat.state).ok_or_else(|| {
            anyhow::anyhow!("unknown heartbeat state {:#04x}", cfg.heartbeat.state)
        })?;
        Ok(Self {
            output_buffer_bytes: cfg.console.output_buffer_bytes,
            chunk_ack_timeout: Duration::from_millis(cfg.console.chunk_ack_timeout_ms),
            heartbeat: cfg
                .heartbeat
                .enabled
                .then(|| cfg.heartbeat.heartbeat_config()),
            initial_state,
        })
    }
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            output_buffer_bytes: 1024,
            chunk_ack_timeout: Duration::from_millis(500),
            heartbeat: Some(HeartbeatConfig::default()),
            initial_state: HeartbeatState::CAN_RUNNING,
        }
    }
}

pub struct Node {
    pub transport: Arc<Transport>,
    pub port: Arc<ConsolePort>,
    pub heartbeat: Arc<HeartbeatValue>,
    pub testrw: Arc<ReadWriteRegister>,
    settings: NodeSettings,
    // The transport only holds a weak reference.
    _dispatcher: Arc<Dispatcher>,
}

impl Node {
    /// Seed the property store and wire every node object into the
    /// transport. Nothing runs until `spawn`.
    pub fn build(
        transport: Arc<Transport>,
        store: Arc<dyn PropertyStore>,
        settings: NodeSettings,
    ) -> anyhow::Result<Self> {
        store.seed_defaults(PROPERTY_DEFAULTS)?;

        let port = ConsolePort::new(
            transport.clone(),
            store.clone(),
            settings.output_buffer_bytes,
            settings.chunk_ack_timeout,
        );
        let heartbeat = Arc::new(HeartbeatValue::new(settings.initial_state));
        let testrw = Arc::new(ReadWriteRegister::new(0));

        let halted = heartbeat.clone();
        let mut dispatcher = Dispatcher::new();
        dispatcher
            .attach_console(port.clone())
            .register(objects::TESTRW, testrw.clone())
            .register(objects::HEARTBEAT, Arc::new(HeartbeatObject(heartbeat.clone())))
            .register(
                objects::AUTOBOOT,
                Arc::new(PropertyObject::read_only(
                    store.clone(),
                    TableProperty::new(names::AUTO_BOOT, tables::BOOLEAN),
                )),
            )
            .register(
                objects::BOOT_DEV,
                Arc::new(PropertyObject::read_only(
                    store.clone(),
                    TableProperty::new(names::BOOT_DEVICE, tables::BOOT_DEVICE),
                )),
            )
            .register(
                objects::RESET_IO,
                Arc::new(PropertyObject::read_write(
                    store.clone(),
                    TableProperty::new(names::INPUT_DEVICE, tables::INPUT_DEVICE),
                    vec![TableProperty::new(names::OUTPUT_DEVICE, tables::OUTPUT_DEVICE)],
                )),
            )
            .register(
                objects::BREAK,
                Arc::new(BreakObject::new(move || {
                    halted.set_state(HeartbeatState::ROM_RUNNING);
                })),
            )
            .register(
                objects::FORCE_DISCONN,
                Arc::new(ForceDisconnectObject::new(transport.clone())),
            );

        let dispatcher = Arc::new(dispatcher);
        let weak: Weak<Dispatcher> = Arc::downgrade(&dispatcher);
        transport.attach_dispatcher(weak);

        tracing::info!(address = %transport.local_address(), "node objects registered");
        Ok(Self {
            transport,
            port,
            heartbeat,
            testrw,
            settings,
            _dispatcher: dispatcher,
        })
    }

    /// Start the delivery loop and, when enabled, the heartbeat.
    pub fn spawn(&self, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![tokio::spawn(
            self.transport.clone().run(shutdown.subscribe()),
        )];
        if let Some(config) = self.settings.heartbeat {
            handles.push(tokio::spawn(run_heartbeat_loop(
                self.transport.clone(),
                self.heartbeat.clone(),
                config,
                shutdown.subscribe(),
            )));
        }
        handles
    }
}

// ============================================================================
// Local console bridge
// ============================================================================

/// Copy local bytes into the console port until EOF or shutdown.
pub async fn pump_console_output<R>(
    port: Arc<ConsolePort>,
    mut source: R,
    mut shutdown: broadcast::Receiver<()>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            read = source.read(&mut buf) => {
                match read {
                    Ok(0) => return,
                    Ok(n) => {
                        let queued = port.write(&buf[..n]);
                        if queued < n && port.is_connected() {
                            tracing::debug!(dropped = n - queued, "console output buffer full");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("console source failed: {e}");
                        return;
                    }
                }
            }
            _ = shutdown.recv() => return,
        }
    }
}

/// Copy bytes typed by the remote owner to `sink`. A hangup is reported to
/// the sink as a line of its own.
pub async fn pump_console_input<W>(
    port: Arc<ConsolePort>,
    mut sink: W,
    mut shutdown: broadcast::Receiver<()>,
) where
    W: AsyncWrite + Unpin,
{
    let mut hangups = port.subscribe_hangup();
    loop {
        tokio::select! {
            b = port.read() => {
                if let Err(e) = sink.write_all(&[b]).await {
                    tracing::warn!("console sink failed: {e}");
                    return;
                }
                let _ = sink.flush().await;
            }
            changed = hangups.changed() => {
                if changed.is_err() {
                    return;
                }
                tracing::info!("console owner hung up");
                let _ = sink.write_all(b"\r\n[hangup]\r\n").await;
                let _ = sink.flush().await;
            }
            _ = shutdown.recv() => return,
        }
    }
}
