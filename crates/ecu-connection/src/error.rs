//! Connection Error Types

use crate::state::ConnectionState;
use obd_transport::TransportError;
use thiserror::Error;

/// Fatal startup failures surfaced to the caller of `connect`
#[derive(Debug, Error)]
pub enum ConnectError {
    /// All startup open attempts failed
    #[error("could not open {port} after {attempts} attempts: {last_error}")]
    OpenExhausted {
        port: String,
        attempts: u32,
        last_error: String,
    },

    /// The port opened but the first handshake query never answered
    #[error("adapter opened but handshake failed: {0}")]
    HandshakeFailed(String),
}

/// Per-query failures; none of these cross component boundaries as
/// panics, upstream components absorb them as invalid readings
#[derive(Debug, Error)]
pub enum QueryError {
    /// Queries are only allowed while Connected or Degraded
    #[error("not connected (state: {0})")]
    NotConnected(ConnectionState),

    /// The transport failed or timed out; drives the degraded/reconnecting
    /// transition
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),

    /// The ECU answered but the reply did not decode into the expected
    /// domain; does not affect connection state
    #[error("reply for {pid} did not decode: {reason}")]
    Decode { pid: String, reason: String },
}
