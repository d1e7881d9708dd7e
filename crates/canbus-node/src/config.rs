//! Configuration types for canbus-node.
//! Parsed from ~/.canbus/config.toml.

use std::path::Path;
use std::time::Duration;

use canbus_objects::HeartbeatConfig;
use canbus_protocol::TIMING;
use canbus_transport::TransportConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CanbusConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub bus: BusSection,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub console: ConsoleSection,
    #[serde(default)]
    pub heartbeat: HeartbeatSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    /// Hex "cluster,module,node".
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,
    #[serde(default = "default_objects_file")]
    pub objects_file: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            database: default_database(),
            hosts_file: default_hosts_file(),
            objects_file: default_objects_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Other stations on the emulated bus. Senders are learned as they appear.
    #[serde(default)]
    pub peers: Vec<String>,
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleSection {
    #[serde(default = "default_escape")]
    pub escape: char,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_ack_deadline_ms")]
    pub ack_deadline_ms: u64,
    #[serde(default = "default_nak_backoff_ms")]
    pub nak_backoff_ms: u64,
    #[serde(default = "default_steal_polls")]
    pub steal_polls: u32,
    #[serde(default = "default_steal_poll_interval_ms")]
    pub steal_poll_interval_ms: u64,
    #[serde(default = "default_input_queue_bytes")]
    pub input_queue_bytes: usize,
    /// Node side: output buffered for the remote owner.
    #[serde(default = "default_output_buffer_bytes")]
    pub output_buffer_bytes: usize,
    #[serde(default = "default_chunk_ack_timeout_ms")]
    pub chunk_ack_timeout_ms: u64,
}

impl Default for ConsoleSection {
    fn default() -> Self {
        Self {
            escape: default_escape(),
            max_retries: default_max_retries(),
            ack_deadline_ms: default_ack_deadline_ms(),
            nak_backoff_ms: default_nak_backoff_ms(),
            steal_polls: default_steal_polls(),
            steal_poll_interval_ms: default_steal_poll_interval_ms(),
            input_queue_bytes: default_input_queue_bytes(),
            output_buffer_bytes: default_output_buffer_bytes(),
            chunk_ack_timeout_ms: default_chunk_ack_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_iam_factor")]
    pub iam_factor: u64,
    #[serde(default)]
    pub board_type: u32,
    /// Heartbeat state code reported at startup.
    #[serde(default = "default_state")]
    pub state: u8,
}

impl Default for HeartbeatSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_heartbeat_interval_ms(),
            iam_factor: default_iam_factor(),
            board_type: 0,
            state: default_state(),
        }
    }
}

// Default value functions
fn default_address() -> String {
    "00,00,02".into()
}
fn default_database() -> String {
    "~/.canbus/properties.db".into()
}
fn default_hosts_file() -> String {
    "~/.canbus/hosts".into()
}
fn default_objects_file() -> String {
    "~/.canbus/objects".into()
}
fn default_listen() -> String {
    "127.0.0.1:7700".into()
}
fn default_escape() -> char {
    '&'
}
fn default_max_retries() -> u32 {
    TIMING.max_retries
}
fn default_ack_deadline_ms() -> u64 {
    TIMING.ack_deadline_ms
}
fn default_nak_backoff_ms() -> u64 {
    TIMING.nak_backoff_ms
}
fn default_steal_polls() -> u32 {
    TIMING.steal_polls
}
fn default_steal_poll_interval_ms() -> u64 {
    TIMING.steal_poll_interval_ms
}
fn default_input_queue_bytes() -> usize {
    TIMING.input_queue_bytes
}
fn default_output_buffer_bytes() -> usize {
    1024
}
fn default_chunk_ack_timeout_ms() -> u64 {
    TIMING.console_ack_timeout_ms
}
fn default_true() -> bool {
    true
}
fn default_heartbeat_interval_ms() -> u64 {
    TIMING.heartbeat_interval_ms
}
fn default_iam_factor() -> u64 {
    TIMING.iam_factor
}
fn default_state() -> u8 {
    0x07
}

impl CanbusConfig {
    /// Load config from file, or defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: CanbusConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}

impl ConsoleSection {
    pub fn escape_byte(&self) -> anyhow::Result<u8> {
        u8::try_from(self.escape)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| anyhow::anyhow!("escape must be an ASCII character, got {:?}", self.escape))
    }
}

impl HeartbeatSection {
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_millis(self.interval_ms),
            iam_factor: self.iam_factor,
            board_type: self.board_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = CanbusConfig::default();
        assert_eq!(cfg.node.address, "00,00,02");
        assert_eq!(cfg.console.max_retries, 20);
        assert_eq!(cfg.console.escape_byte().unwrap(), b'&');
        assert_eq!(cfg.heartbeat.interval_ms, 250);
        assert_eq!(cfg.heartbeat.iam_factor, 0x77);
        assert_eq!(cfg.transport.max_sessions, 256);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[node]
address = "01,02,0b"
database = "/var/lib/canbus/props.db"

[bus]
listen = "0.0.0.0:7700"
peers = ["10.0.0.2:7700", "10.0.0.3:7700"]

[transport]
inbound_slots = 64

[console]
escape = "~"
max_retries = 5

[heartbeat]
enabled = false
board_type = 3
"#;

        let cfg: CanbusConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.node.address, "01,02,0b");
        assert_eq!(cfg.node.hosts_file, "~/.canbus/hosts");
        assert_eq!(cfg.bus.peers.len(), 2);
        assert_eq!(cfg.transport.inbound_slots, 64);
        assert_eq!(cfg.transport.outbound_slots, 1024);
        assert_eq!(cfg.console.escape_byte().unwrap(), b'~');
        assert_eq!(cfg.console.max_retries, 5);
        assert_eq!(cfg.console.steal_polls, 5);
        assert!(!cfg.heartbeat.enabled);
        assert_eq!(cfg.heartbeat.heartbeat_config().board_type, 3);
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let cfg: CanbusConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.bus.listen, "127.0.0.1:7700");
        assert!(cfg.heartbeat.enabled);
    }

    #[test]
    fn test_non_ascii_escape_rejected() {
        let cfg: CanbusConfig = toml::from_str("[console]\nescape = \"é\"\n").unwrap();
        assert!(cfg.console.escape_byte().is_err());
    }

    #[test]
    fn test_serialise_default() {
        let cfg = CanbusConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        assert!(toml_str.contains("[node]"));
        assert!(toml_str.contains("[console]"));
    }
}
