//! Heartbeat states reported to the board H8.
//!
//! On the wire the state is shifted left by two: `value = state << 2`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

const DESCRIPTIONS: [&str; 21] = [
    "held in reset",
    "at OK",
    "running remote self test",
    "ROM loading external code",
    "ROM about to run external code",
    "OS called panic",
    "disk needs checking",
    "the can module has been loaded",
    "UNIX running single user",
    "UNIX going to run level 0",
    "UNIX running at level 1",
    "UNIX running at level 2",
    "UNIX running at level 3",
    "UNIX running at level 4",
    "UNIX running at level 5",
    "UNIX running at level 6",
    "module power is bad",
    "processor is configured out",
    "processor is running vrom",
    "H8 did not respond to request",
    "module is not responding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeartbeatState(u8);

impl HeartbeatState {
    pub const RESET: Self = Self(0x00);
    pub const ROM_RUNNING: Self = Self(0x01);
    pub const PANIC: Self = Self(0x05);
    pub const CAN_RUNNING: Self = Self(0x07);
    pub const RUNLEVEL_S: Self = Self(0x08);
    pub const RUNLEVEL_3: Self = Self(0x0c);
    pub const MODULE_ERROR: Self = Self(0x14);

    pub fn from_code(code: u8) -> Option<Self> {
        ((code as usize) < DESCRIPTIONS.len()).then_some(Self(code))
    }

    /// Decode a heartbeat payload value.
    pub fn from_value(value: u32) -> Option<Self> {
        u8::try_from(value >> 2).ok().and_then(Self::from_code)
    }

    pub fn code(self) -> u8 {
        self.0
    }

    pub fn value(self) -> u32 {
        (self.0 as u32) << 2
    }

    pub fn description(self) -> &'static str {
        DESCRIPTIONS[self.0 as usize]
    }

    pub fn all() -> impl Iterator<Item = HeartbeatState> {
        (0..DESCRIPTIONS.len() as u8).map(HeartbeatState)
    }
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::CAN_RUNNING
    }
}

impl fmt::Display for HeartbeatState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

impl FromStr for HeartbeatState {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HeartbeatState::all()
            .find(|st| st.description().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ProtocolError::UnknownType(s.to_string()))
    }
}
