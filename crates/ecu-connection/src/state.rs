//! Connection State and Events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of the ECU link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No link; nothing has been attempted or an explicit disconnect happened
    Disconnected,
    /// Startup connect in progress
    Connecting,
    /// Link is open and answering
    Connected,
    /// One or more health checks failed; the link may still recover
    Degraded,
    /// Reconnection attempts are running
    Reconnecting,
    /// Reconnection exhausted; manual intervention required
    Failed,
}

impl ConnectionState {
    /// Whether callers may issue queries in this state
    pub fn can_query(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Whether the maintenance loop has nothing left to do
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Why a transition happened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventReason {
    ConnectRequested,
    HandshakeComplete,
    StartupExhausted,
    HealthCheckFailed { consecutive: u32 },
    HealthCheckRecovered,
    QueryFailed,
    QueryRecovered,
    ReconnectAttempt { attempt: u32 },
    Reconnected { attempts: u32 },
    ReconnectExhausted,
    DisconnectRequested,
}

/// One state transition, published to all subscribers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub state: ConnectionState,
    pub timestamp: DateTime<Utc>,
    pub reason: EventReason,
}
