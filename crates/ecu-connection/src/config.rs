//! Connection Manager Configuration

use obd_transport::PortSettings;
use std::time::Duration;

/// Tuning knobs for the connection lifecycle
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Serial port path, e.g. "/dev/rfcomm0"
    pub port: String,
    /// Baud rate (38400 for most ELM327 adapters)
    pub baud_rate: u32,
    /// Startup open attempts before giving up
    pub connect_attempts: u32,
    /// Mid-session reconnection attempts before the link is declared failed
    pub reconnect_attempts: u32,
    /// Backoff base delay between reconnection attempts
    pub reconnect_base_delay: Duration,
    /// Backoff cap
    pub reconnect_max_delay: Duration,
    /// Interval between health checks
    pub health_check_interval: Duration,
    /// Consecutive health-check failures before reconnection starts; at 1
    /// the Degraded state is skipped entirely
    pub degraded_threshold: u32,
    /// Timeout for opening the port
    pub open_timeout: Duration,
    /// Timeout for a single query
    pub query_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            port: "/dev/rfcomm0".to_string(),
            baud_rate: 38_400,
            connect_attempts: 3,
            reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(3),
            reconnect_max_delay: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(10),
            degraded_threshold: 2,
            open_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(2),
        }
    }
}

impl ConnectionConfig {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            open_timeout: self.open_timeout,
            query_timeout: self.query_timeout,
        }
    }
}
