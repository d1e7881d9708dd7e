//! Packet types and explicit header pack/unpack.
//!
//! Standard header (16 bits, MSB first):
//!   priority(1) dest(5) src(5) remote(1) length(4)
//!
//! Extended header (32 bits, MSB first):
//!   priority(1) type(3) cluster(6) module(6) node(6) object(10)

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{ProtocolError, EXT_HEADER_SIZE, MAX_PAYLOAD, RELAY_NODE};

/// Value of every address field in the "no console owner" sentinel.
pub const UNCONNECTED_FIELD: u8 = 0x3f;

// ============================================================================
// Field enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    #[default]
    High,
    Low,
}

impl Priority {
    fn bit(self) -> u32 {
        match self {
            Priority::High => 0,
            Priority::Low => 1,
        }
    }

    fn from_bit(bit: u32) -> Self {
        if bit & 1 == 0 {
            Priority::High
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PacketType {
    Ro,
    Wo,
    Wna,
    Dat,
    Ack,
    Nak,
    Sig,
}

impl PacketType {
    pub const ALL: [PacketType; 7] = [
        PacketType::Ro,
        PacketType::Wo,
        PacketType::Wna,
        PacketType::Dat,
        PacketType::Ack,
        PacketType::Nak,
        PacketType::Sig,
    ];

    pub fn code(self) -> u8 {
        match self {
            PacketType::Ro => 0,
            PacketType::Wo => 1,
            PacketType::Wna => 2,
            PacketType::Dat => 3,
            PacketType::Ack => 4,
            PacketType::Nak => 6,
            PacketType::Sig => 7,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        match code {
            0 => Ok(PacketType::Ro),
            1 => Ok(PacketType::Wo),
            2 => Ok(PacketType::Wna),
            3 => Ok(PacketType::Dat),
            4 => Ok(PacketType::Ack),
            5 => Err(ProtocolError::ReservedType(5)),
            6 => Ok(PacketType::Nak),
            7 => Ok(PacketType::Sig),
            other => Err(ProtocolError::FieldRange {
                field: "type",
                value: other as u32,
                bits: 3,
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PacketType::Ro => "RO",
            PacketType::Wo => "WO",
            PacketType::Wna => "WNA",
            PacketType::Dat => "DAT",
            PacketType::Ack => "ACK",
            PacketType::Nak => "NAK",
            PacketType::Sig => "SIG",
        }
    }

    /// Request types the receiver answers with ACK or NAK.
    pub fn is_ackable(self) -> bool {
        matches!(self, PacketType::Ro | PacketType::Wo | PacketType::Dat)
    }

    pub fn is_reply(self) -> bool {
        matches!(self, PacketType::Ack | PacketType::Nak)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PacketType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PacketType::ALL
            .into_iter()
            .find(|t| t.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// A (cluster, module, node) triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeAddress {
    pub cluster: u8,
    pub module: u8,
    pub node: u8,
}

impl NodeAddress {
    pub const fn new(cluster: u8, module: u8, node: u8) -> Self {
        Self {
            cluster,
            module,
            node,
        }
    }

    /// Unpack the 5-bit-per-field id format used by local address queries.
    pub fn from_packed(id: u32) -> Self {
        Self {
            cluster: ((id >> 12) & 0x1f) as u8,
            module: ((id >> 6) & 0x1f) as u8,
            node: (id & 0x1f) as u8,
        }
    }

    pub fn to_packed(self) -> u32 {
        ((self.cluster as u32 & 0x1f) << 12)
            | ((self.module as u32 & 0x1f) << 6)
            | (self.node as u32 & 0x1f)
    }

    /// Board H8 controller serving this node.
    pub fn board_h8(self) -> Self {
        Self {
            node: (self.node >> 2) + 0x10,
            ..self
        }
    }

    pub fn same_module(&self, other: &NodeAddress) -> bool {
        self.cluster == other.cluster && self.module == other.module
    }

    /// Standard-header destination for a packet from `self` to `target`:
    /// direct within the module, otherwise the module relay.
    pub fn next_hop(&self, target: &NodeAddress) -> u8 {
        if self.same_module(target) {
            target.node
        } else {
            RELAY_NODE
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x},{:x},{:x}", self.cluster, self.module, self.node)
    }
}

impl FromStr for NodeAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ProtocolError::BadAddress(s.to_string());
        let mut fields = s.trim().split(',').map(|f| {
            let f = f.trim();
            let f = f.strip_prefix("0x").unwrap_or(f);
            u8::from_str_radix(f, 16).ok().filter(|v| *v <= 0x3f)
        });
        let cluster = fields.next().flatten().ok_or_else(bad)?;
        let module = fields.next().flatten().ok_or_else(bad)?;
        let node = fields.next().flatten().ok_or_else(bad)?;
        if fields.next().is_some() {
            return Err(bad());
        }
        Ok(Self::new(cluster, module, node))
    }
}

// ============================================================================
// Headers
// ============================================================================

fn check_field(field: &'static str, value: u32, bits: u8) -> Result<(), ProtocolError> {
    if value >> bits == 0 {
        Ok(())
    } else {
        Err(ProtocolError::FieldRange { field, value, bits })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StdHeader {
    pub priority: Priority,
    pub dest: u8,
    pub src: u8,
    pub remote: bool,
    pub length: u8,
}

impl StdHeader {
    pub fn pack(&self) -> u16 {
        ((self.priority.bit() as u16) << 15)
            | ((self.dest as u16 & 0x1f) << 10)
            | ((self.src as u16 & 0x1f) << 5)
            | ((self.remote as u16) << 4)
            | (self.length as u16 & 0x0f)
    }

    pub fn unpack(raw: u16) -> Self {
        Self {
            priority: Priority::from_bit((raw >> 15) as u32),
            dest: ((raw >> 10) & 0x1f) as u8,
            src: ((raw >> 5) & 0x1f) as u8,
            remote: (raw >> 4) & 1 == 1,
            length: (raw & 0x0f) as u8,
        }
    }

    pub fn payload_len(&self) -> usize {
        (self.length.saturating_sub(EXT_HEADER_SIZE) as usize).min(MAX_PAYLOAD)
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_field("dest", self.dest.into(), 5)?;
        check_field("src", self.src.into(), 5)?;
        let min = EXT_HEADER_SIZE;
        let max = EXT_HEADER_SIZE + MAX_PAYLOAD as u8;
        if (min..=max).contains(&self.length) {
            Ok(())
        } else {
            Err(ProtocolError::MalformedLength {
                length: self.length,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExtHeader {
    pub priority: Priority,
    pub kind: PacketType,
    pub cluster: u8,
    pub module: u8,
    pub node: u8,
    pub object: u16,
}

impl ExtHeader {
    pub fn new(kind: PacketType, address: NodeAddress, object: u16) -> Self {
        Self {
            priority: Priority::High,
            kind,
            cluster: address.cluster,
            module: address.module,
            node: address.node,
            object,
        }
    }

    /// The "no console owner" sentinel.
    pub fn unconnected() -> Self {
        Self {
            priority: Priority::High,
            kind: PacketType::Ro,
            cluster: UNCONNECTED_FIELD,
            module: UNCONNECTED_FIELD,
            node: UNCONNECTED_FIELD,
            object: UNCONNECTED_FIELD as u16,
        }
    }

    pub fn is_unconnected(&self) -> bool {
        self.cluster == UNCONNECTED_FIELD
            && self.module == UNCONNECTED_FIELD
            && self.node == UNCONNECTED_FIELD
    }

    pub fn address(&self) -> NodeAddress {
        NodeAddress::new(self.cluster, self.module, self.node)
    }

    pub fn with_kind(self, kind: PacketType) -> Self {
        Self { kind, ..self }
    }

    pub fn with_object(self, object: u16) -> Self {
        Self { object, ..self }
    }

    /// Every field must fit its wire width; `pack` would silently truncate.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        check_field("cluster", self.cluster.into(), 6)?;
        check_field("module", self.module.into(), 6)?;
        check_field("node", self.node.into(), 6)?;
        check_field("object", self.object.into(), 10)
    }

    /// ACK/NAK correlation key: object and address, ignoring type and priority.
    pub fn correlates(&self, other: &ExtHeader) -> bool {
        self.object == other.object
            && self.cluster == other.cluster
            && self.module == other.module
            && self.node == other.node
    }

    pub fn pack(&self) -> u32 {
        (self.priority.bit() << 31)
            | ((self.kind.code() as u32 & 0x7) << 28)
            | ((self.cluster as u32 & 0x3f) << 22)
            | ((self.module as u32 & 0x3f) << 16)
            | ((self.node as u32 & 0x3f) << 10)
            | (self.object as u32 & 0x3ff)
    }

    pub fn unpack(raw: u32) -> Result<Self, ProtocolError> {
        Ok(Self {
            priority: Priority::from_bit(raw >> 31),
            kind: PacketType::from_code(((raw >> 28) & 0x7) as u8)?,
            cluster: ((raw >> 22) & 0x3f) as u8,
            module: ((raw >> 16) & 0x3f) as u8,
            node: ((raw >> 10) & 0x3f) as u8,
            object: (raw & 0x3ff) as u16,
        })
    }
}

impl fmt::Display for ExtHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02x},{:02x},{:02x} obj {:#05x}",
            self.kind, self.cluster, self.module, self.node, self.object
        )
    }
}

// ============================================================================
// Payload and packet
// ============================================================================

/// Four payload bytes. Integer payloads are big-endian.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Payload(pub [u8; MAX_PAYLOAD]);

impl Payload {
    pub fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn from_ext(ext: &ExtHeader) -> Self {
        Self::from_u32(ext.pack())
    }

    pub fn as_ext(&self) -> Result<ExtHeader, ProtocolError> {
        ExtHeader::unpack(self.as_u32())
    }

    /// Copy up to four bytes, zero-padding the rest.
    pub fn from_slice(bytes: &[u8]) -> Self {
        let mut buf = [0u8; MAX_PAYLOAD];
        let n = bytes.len().min(MAX_PAYLOAD);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self(buf)
    }

    pub fn bytes(&self) -> &[u8; MAX_PAYLOAD] {
        &self.0
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({})", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Packet {
    /// Milliseconds since the receiving transport started. Not on the wire.
    pub timestamp: u32,
    pub std: StdHeader,
    pub ext: ExtHeader,
    pub payload: Payload,
}

impl Packet {
    /// Build a packet with an unset destination. Length follows the payload:
    /// 4 without, 8 with.
    pub fn new(ext: ExtHeader, payload: Option<Payload>) -> Self {
        let length = EXT_HEADER_SIZE + if payload.is_some() { MAX_PAYLOAD as u8 } else { 0 };
        Self {
            timestamp: 0,
            std: StdHeader {
                priority: ext.priority,
                dest: 0,
                src: 0,
                remote: false,
                length,
            },
            ext,
            payload: payload.unwrap_or_default(),
        }
    }

    /// Packet carrying `len` significant payload bytes (0..=4).
    pub fn with_data(ext: ExtHeader, data: &[u8]) -> Self {
        let len = data.len().min(MAX_PAYLOAD);
        let mut pkt = Self::new(ext, Some(Payload::from_slice(data)));
        pkt.std.length = EXT_HEADER_SIZE + len as u8;
        pkt
    }

    /// A request from `local` to the object named by `ext`, routed by the
    /// next-hop rule.
    pub fn request(local: &NodeAddress, ext: ExtHeader, payload: Option<Payload>) -> Self {
        let mut pkt = Self::new(ext, payload);
        pkt.std.dest = local.next_hop(&ext.address());
        pkt
    }

    pub fn dest(mut self, dest: u8) -> Self {
        self.std.dest = dest;
        self
    }

    pub fn payload_len(&self) -> usize {
        self.std.payload_len()
    }

    pub fn has_payload(&self) -> bool {
        self.payload_len() > 0
    }

    /// The significant payload bytes.
    pub fn data(&self) -> &[u8] {
        &self.payload.0[..self.payload_len()]
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        self.std.validate()?;
        self.ext.validate()
    }

    /// Turn a request into its ACK/NAK: destination becomes the requester,
    /// the extended header keeps its address and object.
    pub fn reply(&self, kind: PacketType, payload: Option<Payload>) -> Packet {
        let mut pkt = Packet::new(self.ext.with_kind(kind), payload);
        pkt.std.dest = self.std.src;
        pkt.std.priority = self.std.priority;
        pkt
    }

    pub fn ack(&self, payload: Option<Payload>) -> Packet {
        self.reply(PacketType::Ack, payload)
    }

    pub fn nak(&self, payload: Option<Payload>) -> Packet {
        self.reply(PacketType::Nak, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_header_bit_layout() {
        let hdr = StdHeader {
            priority: Priority::Low,
            dest: 0x1d,
            src: 0x03,
            remote: true,
            length: 8,
        };
        // 1 11101 00011 1 1000
        assert_eq!(hdr.pack(), 0b1_11101_00011_1_1000);
        assert_eq!(StdHeader::unpack(hdr.pack()), hdr);
    }

    #[test]
    fn test_ext_header_bit_layout() {
        let ext = ExtHeader {
            priority: Priority::High,
            kind: PacketType::Nak,
            cluster: 0x01,
            module: 0x02,
            node: 0x03,
            object: 0x3f0,
        };
        assert_eq!(
            ext.pack(),
            (6 << 28) | (0x01 << 22) | (0x02 << 16) | (0x03 << 10) | 0x3f0
        );
        assert_eq!(ExtHeader::unpack(ext.pack()).unwrap(), ext);
    }

    #[test]
    fn test_reserved_type_rejected() {
        let raw = 5u32 << 28;
        assert!(matches!(
            ExtHeader::unpack(raw),
            Err(ProtocolError::ReservedType(5))
        ));
    }

    #[test]
    fn test_length_bounds() {
        for length in 0..16u8 {
            let hdr = StdHeader {
                length,
                ..Default::default()
            };
            assert_eq!(hdr.validate().is_ok(), (4..=8).contains(&length));
        }
    }

    #[test]
    fn test_fields_wider_than_the_wire_rejected() {
        let ext = ExtHeader::new(PacketType::Ro, NodeAddress::new(0, 0x40, 2), 0x3ff);
        assert!(matches!(
            ext.validate(),
            Err(ProtocolError::FieldRange { field: "module", value: 0x40, bits: 6 })
        ));
        let ext = ExtHeader::new(PacketType::Ro, NodeAddress::new(0, 0, 2), 0x400);
        assert!(matches!(
            ext.validate(),
            Err(ProtocolError::FieldRange { field: "object", .. })
        ));

        let pkt = Packet::new(ExtHeader::new(PacketType::Ro, NodeAddress::new(0, 0, 0x22), 0x3ff), None)
            .dest(0x22);
        assert!(matches!(
            pkt.validate(),
            Err(ProtocolError::FieldRange { field: "dest", value: 0x22, bits: 5 })
        ));
        assert!(ExtHeader::unconnected().validate().is_ok());
    }

    #[test]
    fn test_unconnected_sentinel() {
        let owner = ExtHeader::unconnected();
        assert!(owner.is_unconnected());
        let bits = owner.pack();
        assert!(ExtHeader::unpack(bits).unwrap().is_unconnected());

        let real = ExtHeader::new(PacketType::Dat, NodeAddress::new(0, 1, 2), 0x123);
        assert!(!real.is_unconnected());
    }

    #[test]
    fn test_reply_swaps_destination() {
        let local = NodeAddress::new(0, 0, 4);
        let ext = ExtHeader::new(PacketType::Wo, NodeAddress::new(0, 0, 9), 0x3ff);
        let mut req = Packet::request(&local, ext, Some(Payload::from_u32(7)));
        req.std.src = local.node;
        assert_eq!(req.std.dest, 9);

        let ack = req.ack(Some(Payload::from_u32(6)));
        assert_eq!(ack.std.dest, 4);
        assert_eq!(ack.ext.kind, PacketType::Ack);
        assert!(ack.ext.correlates(&req.ext));
        assert_eq!(ack.std.length, 8);

        let nak = req.nak(None);
        assert_eq!(nak.std.length, 4);
        assert!(!nak.has_payload());
    }

    #[test]
    fn test_next_hop_uses_relay_off_module() {
        let local = NodeAddress::new(0, 1, 4);
        assert_eq!(local.next_hop(&NodeAddress::new(0, 1, 9)), 9);
        assert_eq!(local.next_hop(&NodeAddress::new(0, 2, 9)), RELAY_NODE);
        assert_eq!(local.next_hop(&NodeAddress::new(1, 1, 9)), RELAY_NODE);
    }

    #[test]
    fn test_board_h8() {
        assert_eq!(NodeAddress::new(0, 0, 0).board_h8().node, 0x10);
        assert_eq!(NodeAddress::new(0, 0, 7).board_h8().node, 0x11);
        assert_eq!(NodeAddress::new(0, 0, 0x0f).board_h8().node, 0x13);
    }

    #[test]
    fn test_packed_address() {
        let id = (3 << 12) | (2 << 6) | 5;
        let addr = NodeAddress::from_packed(id);
        assert_eq!(addr, NodeAddress::new(3, 2, 5));
        assert_eq!(addr.to_packed(), id);
    }

    #[test]
    fn test_address_parse_display() {
        let addr: NodeAddress = "1,a,1f".parse().unwrap();
        assert_eq!(addr, NodeAddress::new(1, 0xa, 0x1f));
        assert_eq!(addr.to_string(), "1,a,1f");
        assert!("1,2".parse::<NodeAddress>().is_err());
        assert!("1,2,3,4".parse::<NodeAddress>().is_err());
        assert!("1,2,zz".parse::<NodeAddress>().is_err());
        assert!("40,0,0".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn test_type_names() {
        assert_eq!("wna".parse::<PacketType>().unwrap(), PacketType::Wna);
        assert_eq!("Ack".parse::<PacketType>().unwrap(), PacketType::Ack);
        assert!("bogus".parse::<PacketType>().is_err());
        for kind in PacketType::ALL {
            assert_eq!(PacketType::from_code(kind.code()).unwrap(), kind);
        }
        assert!(PacketType::Dat.is_ackable());
        assert!(!PacketType::Wna.is_ackable());
    }

    #[test]
    fn test_with_data_length() {
        let ext = ExtHeader::new(PacketType::Dat, NodeAddress::default(), 0);
        let pkt = Packet::with_data(ext, b"ab");
        assert_eq!(pkt.std.length, 6);
        assert_eq!(pkt.data(), b"ab");
        let empty = Packet::with_data(ext, b"");
        assert_eq!(empty.data(), b"");
    }

    #[test]
    fn test_packet_serializes_type_names() {
        let ext = ExtHeader::new(PacketType::Wna, NodeAddress::default(), 0x31);
        let json = serde_json::to_string(&Packet::new(ext, None)).unwrap();
        assert!(json.contains("\"WNA\""));
    }
}
