//! Runtime Configuration

use config::{Config, ConfigError, Environment, File};
use ecu_connection::ConnectionConfig;
use pid_discovery::DiscoveryOptions;
use scenario_capture::CaptureOptions;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Everything tunable from `datalogger.toml` or `DATALOGGER_*` env vars.
/// Every field has a working default; a missing config file is fine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Serial port bound to the Bluetooth adapter
    pub port: String,
    pub baud_rate: u32,
    /// Root directory for session and discovery output
    pub data_dir: PathBuf,
    pub connect_attempts: u32,
    pub reconnect_attempts: u32,
    pub reconnect_base_delay_s: u64,
    pub reconnect_max_delay_s: u64,
    pub health_check_interval_s: u64,
    pub degraded_threshold: u32,
    pub sampling_rate_hz: f64,
    pub include_manufacturer_pids: bool,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            port: defaults.port,
            baud_rate: defaults.baud_rate,
            data_dir: PathBuf::from("data"),
            connect_attempts: defaults.connect_attempts,
            reconnect_attempts: defaults.reconnect_attempts,
            reconnect_base_delay_s: defaults.reconnect_base_delay.as_secs(),
            reconnect_max_delay_s: defaults.reconnect_max_delay.as_secs(),
            health_check_interval_s: defaults.health_check_interval.as_secs(),
            degraded_threshold: defaults.degraded_threshold,
            sampling_rate_hz: 1.0,
            include_manufacturer_pids: false,
        }
    }
}

impl Settings {
    /// Layered load: optional TOML file, then `DATALOGGER_*` env overrides
    pub fn load(file: Option<&str>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(file.unwrap_or("datalogger")).required(false))
            .add_source(Environment::with_prefix("DATALOGGER").try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            port: self.port.clone(),
            baud_rate: self.baud_rate,
            connect_attempts: self.connect_attempts,
            reconnect_attempts: self.reconnect_attempts,
            reconnect_base_delay: Duration::from_secs(self.reconnect_base_delay_s),
            reconnect_max_delay: Duration::from_secs(self.reconnect_max_delay_s),
            health_check_interval: Duration::from_secs(self.health_check_interval_s),
            degraded_threshold: self.degraded_threshold,
            ..ConnectionConfig::default()
        }
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            sampling_rate_hz: self.sampling_rate_hz,
        }
    }

    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            include_manufacturer: self.include_manufacturer_pids,
            ..DiscoveryOptions::default()
        }
    }
}
