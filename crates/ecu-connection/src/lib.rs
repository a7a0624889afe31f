//! ECU Connection Manager
//!
//! Owns the transport handle and the connection lifecycle: startup connect,
//! periodic health checks, degraded-link detection, and exponential-backoff
//! reconnection. Every state transition is published on an event channel so
//! data-producing components can pause and resume instead of managing
//! reconnection themselves.

mod backoff;
mod config;
mod error;
mod manager;
mod state;

pub use backoff::backoff_delay;
pub use config::ConnectionConfig;
pub use error::{ConnectError, QueryError};
pub use manager::{ConnectionInfo, ConnectionManager, ConnectionStats, PidValue};
pub use state::{ConnectionEvent, ConnectionState, EventReason};
