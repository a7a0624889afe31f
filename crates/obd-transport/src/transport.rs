//! Transport Traits and Boundary Types

use crate::command::ObdCommand;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Identification of the negotiated ECU protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolInfo {
    /// Protocol name as reported by the adapter, e.g. "ISO 15765-4 (CAN 11/500)"
    pub name: String,
    /// Adapter protocol number, e.g. "6"
    pub id: String,
    /// Port the link was opened on
    pub port: String,
    /// Number of ECUs that answered the handshake
    pub ecu_count: u32,
}

/// One raw reply from the adapter
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// Decoded payload bytes (after mode/pid echo); empty when the ECU
    /// returned NO DATA or the reply was not parseable as hex
    pub payload: Vec<u8>,
    /// Reply text as received, for diagnostics and manufacturer scans
    pub text: String,
}

impl RawResponse {
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }
}

/// Serial port parameters for opening a link
#[derive(Debug, Clone)]
pub struct PortSettings {
    pub port: String,
    pub baud_rate: u32,
    pub open_timeout: Duration,
    pub query_timeout: Duration,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            port: "/dev/rfcomm0".to_string(),
            baud_rate: 38_400,
            open_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(2),
        }
    }
}

/// Factory for transport handles
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the port and initialize the adapter
    async fn open(
        &self,
        settings: &PortSettings,
    ) -> Result<Box<dyn TransportHandle>, TransportError>;
}

/// One open adapter link. Queries are issued one at a time; the serial link
/// is half-duplex and the caller is responsible for serializing access.
#[async_trait]
pub trait TransportHandle: Send {
    /// Issue one read command and wait for the adapter's reply
    async fn query(
        &mut self,
        command: ObdCommand,
        timeout: Duration,
    ) -> Result<RawResponse, TransportError>;

    /// Release the link; the handle is unusable afterwards
    async fn close(&mut self);

    /// Whether the link is still considered open
    fn is_alive(&self) -> bool;

    /// Protocol identification captured during open
    fn protocol_info(&self) -> ProtocolInfo;
}
