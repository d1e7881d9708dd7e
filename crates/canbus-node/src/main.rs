//! Canbus Node -- node daemon and operator tools for the CAN bus.
//!
//! Usage:
//!   canbus-node serve                    # Run a node on the bus
//!   canbus-node console <host> [-f]      # Remote console (-f steals it)
//!   canbus-node ping <host> [-c count]   # WO TESTRW round trips
//!   canbus-node snoop [-p] [-H] [--json|--raw] # Watch bus traffic
//!   canbus-node ctl <type> <obj> <host> [data]
//!   canbus-node hosts | objects          # Print name tables
//!
//! Every invocation is its own station on the bus; give concurrent tools
//! distinct `--node` and `--listen` values.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use canbus_console::{
    run_ack_pump, AckStaging, Console, ConsoleEvent, ConsoleOptions, ConsoleState, Outcome,
    TransactionClient, TransactionPolicy,
};
use canbus_node::config::CanbusConfig;
use canbus_node::expand_tilde;
use canbus_node::node::{pump_console_input, pump_console_output, Node, NodeSettings};
use canbus_node::resolver::{HostTable, ObjectTable};
use canbus_node::tools::{self, SnoopFormatter};
use canbus_node::udp_bus::UdpBus;
use canbus_protocol::{NodeAddress, PacketType, TIMING};
use canbus_storage::{PropertyStore, SqliteProperties};
use canbus_transport::Transport;
use clap::{Parser, Subcommand};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "canbus-node", about = "CAN bus node daemon and console tools")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "~/.canbus/config.toml")]
    config: String,

    /// Local bus address, hex "cluster,module,node" (overrides config)
    #[arg(long)]
    node: Option<String>,

    /// UDP address to bind (overrides config)
    #[arg(long)]
    listen: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node (default)
    Serve,
    /// Connect to a node's console
    Console {
        host: String,
        /// Steal the console from its current owner
        #[arg(short, long)]
        force: bool,
        /// Escape character
        #[arg(short, long)]
        escape: Option<char>,
    },
    /// Time WO TESTRW round trips
    Ping {
        host: String,
        /// Stop after this many requests
        #[arg(short, long)]
        count: Option<u32>,
        /// Do not pause between requests
        #[arg(short, long)]
        flood: bool,
    },
    /// Print bus traffic seen by this station
    Snoop {
        /// Also capture frames addressed to other nodes
        #[arg(short, long)]
        promiscuous: bool,
        /// Hide heartbeats
        #[arg(short = 'H', long)]
        no_heartbeat: bool,
        /// One JSON object per packet
        #[arg(long, conflicts_with = "raw")]
        json: bool,
        /// Binary capture: 16-byte API frames with receive timestamps
        #[arg(long)]
        raw: bool,
    },
    /// Send one request and print the reply
    Ctl {
        /// RO, WO, WNA, DAT, ACK, NAK or SIG
        kind: String,
        /// Object name or hex id
        object: String,
        host: String,
        /// 0x-prefixed hex or decimal payload
        data: Option<String>,
    },
    /// List known hosts
    Hosts,
    /// List known objects
    Objects,
}

fn init_tracing(json: bool, default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let serving = matches!(cli.command, Some(Commands::Serve) | None);
    init_tracing(
        cli.log_json,
        if serving {
            "canbus_node=info,canbus_transport=info,canbus_objects=info"
        } else {
            "canbus_node=warn,canbus_console=warn,canbus_transport=warn"
        },
    );

    let config_path = expand_tilde(&cli.config);
    let mut cfg = CanbusConfig::load_or_default(&config_path)?;
    if let Some(node) = cli.node {
        cfg.node.address = node;
    }
    if let Some(listen) = cli.listen {
        cfg.bus.listen = listen;
    }
    let hosts = HostTable::load(&expand_tilde(&cfg.node.hosts_file))?;
    let objects = ObjectTable::load(&expand_tilde(&cfg.node.objects_file))?;

    match cli.command {
        Some(Commands::Serve) | None => {
            serve(cfg).await?;
            // The stdin reader thread would otherwise hold the runtime open.
            std::process::exit(0);
        }
        Some(Commands::Console {
            host,
            force,
            escape,
        }) => {
            let code = match console(&cfg, &hosts, &objects, &host, force, escape).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("canbus-node: {e}");
                    1
                }
            };
            std::process::exit(code);
        }
        Some(Commands::Ping { host, count, flood }) => {
            ping(&cfg, &hosts, &host, count, flood).await?;
        }
        Some(Commands::Snoop {
            promiscuous,
            no_heartbeat,
            json,
            raw,
        }) => {
            let output = if raw {
                SnoopOutput::Raw
            } else if json {
                SnoopOutput::Json
            } else {
                SnoopOutput::Lines
            };
            snoop(&cfg, hosts, objects, promiscuous, no_heartbeat, output).await?;
        }
        Some(Commands::Ctl {
            kind,
            object,
            host,
            data,
        }) => {
            ctl(&cfg, &hosts, &objects, &kind, &object, &host, data.as_deref()).await?;
        }
        Some(Commands::Hosts) => {
            for (address, name) in hosts.iter() {
                println!(
                    "{:02x},{:02x},{:02x}  {name}",
                    address.cluster, address.module, address.node
                );
            }
        }
        Some(Commands::Objects) => {
            for (id, name) in objects.all() {
                println!("{id:03x}  {name}");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Station
// ============================================================================

/// A transport on the UDP bus with its receiver running.
struct Station {
    transport: Arc<Transport>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
}

impl Station {
    async fn open(cfg: &CanbusConfig) -> anyhow::Result<Self> {
        let address: NodeAddress = cfg.node.address.parse()?;
        let bus = UdpBus::bind(&cfg.bus.listen, &cfg.bus.peers).await?;
        let receiver = bus.receiver();
        let transport = Transport::new(address, Arc::new(bus), &cfg.transport);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let handles = vec![tokio::spawn(
            receiver.run(transport.clone(), shutdown_tx.subscribe()),
        )];
        Ok(Self {
            transport,
            shutdown_tx,
            handles,
        })
    }

    /// Run the delivery loop here; `serve` leaves it to the node instead.
    fn start_delivery(&mut self) {
        self.handles.push(tokio::spawn(
            self.transport.clone().run(self.shutdown_tx.subscribe()),
        ));
    }

    fn spawn(&mut self, task: impl std::future::Future<Output = ()> + Send + 'static) {
        self.handles.push(tokio::spawn(task));
    }

    async fn close(self) {
        let _ = self.shutdown_tx.send(());
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

fn transaction_client(station: &mut Station, policy: TransactionPolicy) -> anyhow::Result<TransactionClient> {
    let session = Arc::new(station.transport.open_session()?);
    let staging = Arc::new(AckStaging::new(TIMING.staging_capacity));
    let shutdown = station.shutdown_tx.subscribe();
    station.spawn(run_ack_pump(session.clone(), staging.clone(), shutdown));
    Ok(TransactionClient::new(session, staging, policy))
}

// ============================================================================
// Commands
// ============================================================================

async fn serve(cfg: CanbusConfig) -> anyhow::Result<()> {
    let db_path = expand_tilde(&cfg.node.database);
    let store: Arc<dyn PropertyStore> = Arc::new(SqliteProperties::open(&db_path)?);
    tracing::info!(db = %db_path.display(), "properties opened");

    let mut station = Station::open(&cfg).await?;
    let node = Node::build(station.transport.clone(), store, NodeSettings::from_config(&cfg)?)?;
    for handle in node.spawn(&station.shutdown_tx) {
        station.handles.push(handle);
    }
    let shutdown = station.shutdown_tx.subscribe();
    station.spawn(pump_console_output(node.port.clone(), tokio::io::stdin(), shutdown));
    let shutdown = station.shutdown_tx.subscribe();
    station.spawn(pump_console_input(node.port.clone(), tokio::io::stdout(), shutdown));

    tracing::info!(
        address = %station.transport.local_address(),
        listen = %cfg.bus.listen,
        peers = cfg.bus.peers.len(),
        version = env!("CARGO_PKG_VERSION"),
        "canbus-node serving"
    );
    if node.port.is_connected() {
        tracing::info!(owner = %node.port.owner(), "console held over from last run");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    station.close().await;
    Ok(())
}

async fn console(
    cfg: &CanbusConfig,
    hosts: &HostTable,
    objects: &ObjectTable,
    host: &str,
    force: bool,
    escape: Option<char>,
) -> anyhow::Result<()> {
    let target = hosts.resolve(host)?;
    let escape = match escape {
        Some(c) => u8::try_from(c)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| anyhow::anyhow!("escape must be an ASCII character, got {c:?}"))?,
        None => cfg.console.escape_byte()?,
    };

    let mut station = Station::open(cfg).await?;
    station.start_delivery();
    let session = station.transport.open_session()?;

    let mut options = ConsoleOptions::new(target);
    options.steal = force;
    options.escape = escape;
    options.max_retries = cfg.console.max_retries;
    options.steal_polls = cfg.console.steal_polls;
    options.steal_poll_interval = Duration::from_millis(cfg.console.steal_poll_interval_ms);
    options.reset_object = objects.lookup("RESET");
    options.input_queue_bytes = cfg.console.input_queue_bytes;
    options.policy = TransactionPolicy {
        deadline: Duration::from_millis(cfg.console.ack_deadline_ms),
        nak_backoff: Duration::from_millis(cfg.console.nak_backoff_ms),
    };

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let console = Console::open(session, options, events_tx)?;
    let handle = console.handle();
    let name = hosts.display(&target);

    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = events_rx.recv().await {
            match event {
                ConsoleEvent::Data(bytes) => {
                    let _ = stdout.write_all(&bytes).await;
                    let _ = stdout.flush().await;
                }
                ConsoleEvent::Notice(text) => eprint!("\r\n{text}\r\n"),
                ConsoleEvent::Progress => eprint!("."),
            }
        }
    });

    let watcher = {
        let handle = handle.clone();
        let mut states = handle.watch();
        let e = escape as char;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = states.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        if *states.borrow() == ConsoleState::Connected {
                            eprint!("Connected to {name}. Escape is '{e}', {e}? for help.\r\n");
                        }
                    }
                    interrupted = tokio::signal::ctrl_c() => {
                        if interrupted.is_ok() {
                            handle.disconnect();
                        }
                        return;
                    }
                }
            }
        })
    };

    let result = console.run(tokio::io::stdin()).await;
    watcher.abort();
    let _ = tokio::time::timeout(Duration::from_millis(100), printer).await;
    station.close().await;
    if result.is_ok() {
        eprint!("Disconnected.\r\n");
    }
    Ok(result?)
}

async fn ping(
    cfg: &CanbusConfig,
    hosts: &HostTable,
    host: &str,
    count: Option<u32>,
    flood: bool,
) -> anyhow::Result<()> {
    let target = hosts.resolve(host)?;
    let mut station = Station::open(cfg).await?;
    station.start_delivery();
    let policy = TransactionPolicy {
        deadline: Duration::from_secs(1),
        nak_backoff: Duration::ZERO,
    };
    let mut client = transaction_client(&mut station, policy)?;

    println!(
        "PING {}: ({:#x},{:#x},{:#x}):  WO TESTRW",
        hosts.display(&target),
        target.cluster,
        target.module,
        target.node
    );

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let (mut sent, mut responses) = (0u32, 0u32);
    let mut seq = 0u32;
    'pinging: while count.map_or(true, |c| sent < c) {
        tokio::select! {
            reply = tools::ping_once(&mut client, target, seq) => {
                if let Some(reply) = reply {
                    println!("{}", reply.line(&target));
                    responses += 1;
                }
            }
            _ = &mut ctrl_c => break 'pinging,
        }
        sent += 1;
        seq = seq.wrapping_add(1);
        if !flood && count.map_or(true, |c| sent < c) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = &mut ctrl_c => break 'pinging,
            }
        }
    }

    println!("--- {} can ping statistics ---", hosts.display(&target));
    println!("{sent} requests sent, {responses} responses received");
    station.close().await;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnoopOutput {
    Lines,
    Json,
    Raw,
}

async fn snoop(
    cfg: &CanbusConfig,
    hosts: HostTable,
    objects: ObjectTable,
    promiscuous: bool,
    no_heartbeat: bool,
    output: SnoopOutput,
) -> anyhow::Result<()> {
    let mut station = Station::open(cfg).await?;
    station.start_delivery();
    let session = station.transport.open_session()?;
    session.set_snoopy(true)?;
    if promiscuous {
        session.set_promiscuous(true)?;
    }
    let mut formatter = SnoopFormatter::new(hosts, objects, no_heartbeat);
    let mut stdout = tokio::io::stdout();
    let mut frames = BytesMut::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            pkt = session.recv() => match output {
                SnoopOutput::Lines => {
                    if let Some(line) = formatter.line(&pkt) {
                        println!("{line}");
                    }
                }
                SnoopOutput::Json => {
                    if let Some(record) = formatter.record(&pkt) {
                        println!("{}", serde_json::to_string(&record)?);
                    }
                }
                SnoopOutput::Raw => {
                    if formatter.frame(&pkt, &mut frames)? {
                        stdout.write_all(&frames.split()).await?;
                        stdout.flush().await?;
                    }
                }
            },
            _ = &mut ctrl_c => break,
        }
    }

    drop(session);
    station.close().await;
    Ok(())
}

async fn ctl(
    cfg: &CanbusConfig,
    hosts: &HostTable,
    objects: &ObjectTable,
    kind: &str,
    object: &str,
    host: &str,
    data: Option<&str>,
) -> anyhow::Result<()> {
    let kind: PacketType = kind.parse()?;
    let object = objects.resolve(object)?;
    let target = hosts.resolve(host)?;
    let data = data
        .map(|d| tools::parse_data(d).ok_or_else(|| anyhow::anyhow!("{d}: bad data")))
        .transpose()?;

    let mut station = Station::open(cfg).await?;
    station.start_delivery();
    let request = tools::ctl_request(&station.transport.local_address(), kind, object, target, data);

    if !tools::expects_reply(kind) {
        station.transport.send(request)?;
        station.close().await;
        return Ok(());
    }

    let policy = TransactionPolicy {
        deadline: Duration::from_millis(cfg.console.ack_deadline_ms),
        nak_backoff: Duration::ZERO,
    };
    let mut client = transaction_client(&mut station, policy)?;
    let outcome = client.send_and_wait(request, 0).await;
    drop(client);
    station.close().await;

    match outcome {
        Outcome::Acked(reply) | Outcome::Naked(reply) => {
            println!("{}", tools::format_reply(&reply));
            Ok(())
        }
        Outcome::TimedOut => anyhow::bail!("no reply from {}", hosts.display(&target)),
    }
}
