//! Read-Only OBD-II Command Types
//!
//! `ObdCommand` can only be built from the request modes listed in `PidMode`.
//! Mode 04 (clear DTC) and every other write/control mode is deliberately
//! absent from the enum, which keeps the entire tool read-only by
//! construction.

use serde::{Deserialize, Serialize};

/// OBD-II request modes this tool is allowed to issue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PidMode {
    /// Mode 01: standardized current data
    Standard01,
    /// Mode 21: manufacturer-defined data
    Manufacturer21,
    /// Mode 22: manufacturer-defined data (UDS-style addressing)
    Manufacturer22,
}

impl PidMode {
    /// Request mode byte as sent on the wire
    pub fn as_byte(self) -> u8 {
        match self {
            PidMode::Standard01 => 0x01,
            PidMode::Manufacturer21 => 0x21,
            PidMode::Manufacturer22 => 0x22,
        }
    }

    /// Mode byte the ECU echoes in a positive reply (request + 0x40)
    pub fn reply_byte(self) -> u8 {
        self.as_byte() + 0x40
    }
}

impl std::fmt::Display for PidMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:02X}", self.as_byte())
    }
}

/// A single read request: mode plus parameter id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObdCommand {
    mode: PidMode,
    pid: u8,
}

impl ObdCommand {
    /// Build a read command
    pub const fn read(mode: PidMode, pid: u8) -> Self {
        Self { mode, pid }
    }

    pub const fn mode(&self) -> PidMode {
        self.mode
    }

    pub const fn pid(&self) -> u8 {
        self.pid
    }

    /// Canonical id string, e.g. "010C"
    pub fn id(&self) -> String {
        format!("{:02X}{:02X}", self.mode.as_byte(), self.pid)
    }

    /// Wire form without terminator, e.g. "010C"
    pub fn to_wire(&self) -> String {
        self.id()
    }
}

impl std::fmt::Display for ObdCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id())
    }
}
