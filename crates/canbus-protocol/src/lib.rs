//! Canbus Protocol -- packet layout, frame codecs, object namespace.
//!
//! Bus frames are 10 bytes: 16-bit standard header, 32-bit extended header,
//! 4-byte payload, all big-endian. The local API frame prepends a 32-bit
//! receive timestamp and pads the standard header to a word.

pub mod codec;
pub mod heartbeat;
pub mod objects;
pub mod packet;
pub mod timing;

pub use codec::{ApiFrameCodec, BusFrameCodec};
pub use heartbeat::HeartbeatState;
pub use packet::*;
pub use timing::{BusTiming, TIMING};

/// Size of the extended header counted in the standard header length field.
pub const EXT_HEADER_SIZE: u8 = 4;

/// Maximum payload carried by one packet.
pub const MAX_PAYLOAD: usize = 4;

/// Bytes on the bus: std (2) + ext (4) + payload (4).
pub const BUS_FRAME_SIZE: usize = 10;

/// Bytes in the local API frame: timestamp (4) + std (2) + pad (2) + ext (4) + payload (4).
pub const API_FRAME_SIZE: usize = 16;

/// Node id of the module-level relay (module H8).
pub const RELAY_NODE: u8 = 0x1d;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: length {length} outside 4..=8")]
    MalformedLength { length: u8 },
    #[error("malformed frame: reserved packet type {0}")]
    ReservedType(u8),
    #[error("{field} value {value:#x} does not fit in {bits} bits")]
    FieldRange {
        field: &'static str,
        value: u32,
        bits: u8,
    },
    #[error("unknown packet type: {0}")]
    UnknownType(String),
    #[error("bad address {0:?}: expected hex cluster,module,node")]
    BadAddress(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
