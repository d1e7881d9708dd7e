//! Operator tools -- ping, snoop and ctl, minus the terminal plumbing.

use std::time::Duration;

use bytes::BytesMut;
use canbus_console::{Outcome, TransactionClient};
use canbus_protocol::{
    objects, ApiFrameCodec, ExtHeader, NodeAddress, Packet, PacketType, Payload, ProtocolError, MAX_PAYLOAD,
};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::codec::Encoder;

use crate::resolver::{HostTable, ObjectTable};

/// Payload bytes as `"de ad "` hex and printable characters.
pub fn format_data(bytes: &[u8]) -> (String, String) {
    let hex = bytes.iter().map(|b| format!("{b:02x} ")).collect();
    let chars = bytes
        .iter()
        .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
        .collect();
    (hex, chars)
}

/// `0x`-prefixed hex or decimal.
pub fn parse_data(arg: &str) -> Option<u32> {
    match arg.strip_prefix("0x").or_else(|| arg.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => arg.parse().ok(),
    }
}

// ============================================================================
// Ping
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingReply {
    pub seq: u32,
    pub acked: bool,
    pub rtt: Duration,
    pub response: u32,
    pub response_len: usize,
}

impl PingReply {
    /// Trailing complaint when the old register value is not `seq - 1`.
    pub fn anomaly(&self) -> Option<String> {
        if self.acked && self.seq != 0 && self.response != self.seq.wrapping_sub(1) {
            Some(format!(
                "response ({}) != seq - 1 ({})",
                self.response,
                self.seq.wrapping_sub(1)
            ))
        } else if self.response_len != MAX_PAYLOAD {
            Some(format!("size of response ({}) != {MAX_PAYLOAD}", self.response_len))
        } else {
            None
        }
    }

    pub fn line(&self, target: &NodeAddress) -> String {
        let mut line = format!(
            "{} from ({:#x},{:#x},{:#x}) seq={} time={:.3} ms",
            if self.acked { "ACK" } else { "NAK" },
            target.cluster,
            target.module,
            target.node,
            self.seq,
            self.rtt.as_secs_f64() * 1000.0
        );
        if let Some(anomaly) = self.anomaly() {
            line.push_str(" <-- ");
            line.push_str(&anomaly);
        }
        line
    }
}

/// Write `seq` to the target's TESTRW register and time the reply. `None`
/// when nothing came back within the client's deadline.
pub async fn ping_once(client: &mut TransactionClient, target: NodeAddress, seq: u32) -> Option<PingReply> {
    let local = client.session().local_address();
    let request = Packet::request(
        &local,
        ExtHeader::new(PacketType::Wo, target, objects::TESTRW),
        Some(Payload::from_u32(seq)),
    );
    let started = Instant::now();
    let (acked, reply) = match client.send_and_wait(request, 0).await {
        Outcome::Acked(reply) => (true, reply),
        Outcome::Naked(reply) => (false, reply),
        Outcome::TimedOut => return None,
    };
    Some(PingReply {
        seq,
        acked,
        rtt: started.elapsed(),
        response: reply.payload.as_u32(),
        response_len: reply.payload_len(),
    })
}

// ============================================================================
// Ctl
// ============================================================================

/// WNA and the reply types are fire-and-forget.
pub fn expects_reply(kind: PacketType) -> bool {
    !matches!(
        kind,
        PacketType::Wna | PacketType::Ack | PacketType::Nak | PacketType::Sig
    )
}

pub fn ctl_request(local: &NodeAddress, kind: PacketType, object: u16, target: NodeAddress, data: Option<u32>) -> Packet {
    Packet::request(
        local,
        ExtHeader::new(kind, target, object),
        data.map(Payload::from_u32),
    )
}

/// `ACK:  00 00 00 07   '....'`, or the bare type without payload.
pub fn format_reply(reply: &Packet) -> String {
    let kind = if reply.ext.kind == PacketType::Ack { "ACK" } else { "NAK" };
    if !reply.has_payload() {
        return kind.to_string();
    }
    let (hex, chars) = format_data(reply.data());
    format!("{kind}:  {hex:<11.11}   '{chars:<4.4}'")
}

// ============================================================================
// Snoop
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SnoopRecord {
    pub captured_at: String,
    pub elapsed: f64,
    pub src: u8,
    pub dest: u8,
    pub kind: PacketType,
    pub address: String,
    pub object: String,
    pub data: String,
}

pub struct SnoopFormatter {
    hosts: HostTable,
    objects: ObjectTable,
    hide_heartbeat: bool,
    first: Option<u32>,
}

impl SnoopFormatter {
    pub fn new(hosts: HostTable, objects: ObjectTable, hide_heartbeat: bool) -> Self {
        Self {
            hosts,
            objects,
            hide_heartbeat,
            first: None,
        }
    }

    /// Seconds since the first packet shown.
    fn elapsed(&mut self, pkt: &Packet) -> f64 {
        let first = *self.first.get_or_insert(pkt.timestamp);
        f64::from(pkt.timestamp.saturating_sub(first)) / 1000.0
    }

    /// Replies and console data carry no object name.
    fn object(&self, pkt: &Packet) -> String {
        match pkt.ext.kind {
            PacketType::Ack | PacketType::Nak | PacketType::Dat => format!("{:04x}", pkt.ext.object),
            _ => self
                .objects
                .name_of(pkt.ext.object)
                .map_or_else(|| format!("{:04x}", pkt.ext.object), str::to_string),
        }
    }

    fn address(&self, pkt: &Packet) -> String {
        let address = pkt.ext.address();
        match self.hosts.name_of(&address) {
            Some(name) => name.to_string(),
            None => format!("{:02x},{:02x},{:02x}", address.cluster, address.module, address.node),
        }
    }

    fn hidden(&self, pkt: &Packet) -> bool {
        self.hide_heartbeat && pkt.ext.object == objects::HEARTBEAT
    }

    /// `6.555 013->00c  RO  00,00,0c HEARTBEAT     00 00 00 00  ....`
    pub fn line(&mut self, pkt: &Packet) -> Option<String> {
        if self.hidden(pkt) {
            return None;
        }
        let elapsed = self.elapsed(pkt);
        let (hex, chars) = format_data(pkt.data());
        Some(format!(
            "{elapsed:.3} {:03x}->{:03x}  {:<3} {:<8} {:<12.12}  {hex:<11.11} {chars:<4.4}",
            pkt.std.src,
            pkt.std.dest,
            pkt.ext.kind.name(),
            self.address(pkt),
            self.object(pkt),
        ))
    }

    pub fn record(&mut self, pkt: &Packet) -> Option<SnoopRecord> {
        if self.hidden(pkt) {
            return None;
        }
        Some(SnoopRecord {
            captured_at: chrono::Utc::now().to_rfc3339(),
            elapsed: self.elapsed(pkt),
            src: pkt.std.src,
            dest: pkt.std.dest,
            kind: pkt.ext.kind,
            address: self.address(pkt),
            object: self.object(pkt),
            data: hex::encode(pkt.data()),
        })
    }

    /// Append `pkt` as a local API frame (receive timestamp included) for a
    /// binary capture. Returns false when the packet is filtered out.
    pub fn frame(&mut self, pkt: &Packet, dst: &mut BytesMut) -> Result<bool, ProtocolError> {
        if self.hidden(pkt) {
            return Ok(false);
        }
        ApiFrameCodec.encode(*pkt, dst)?;
        Ok(true)
    }
}
