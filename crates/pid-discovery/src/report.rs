//! Discovery Report Types

use chrono::{DateTime, Utc};
use obd_transport::{PidSet, ProtocolInfo};
use serde::{Deserialize, Serialize};

/// A standard parameter that answered with an in-domain value
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredPid {
    pub id: String,
    pub name: String,
    pub unit: String,
    /// Sample value decoded during the scan
    pub value: f64,
}

/// A manufacturer-specific parameter that answered with some payload;
/// no decode table exists for these, so the raw reply is kept
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManufacturerCandidate {
    pub id: String,
    pub raw: String,
}

/// Everything learned in one discovery run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryReport {
    pub discovered_at: DateTime<Utc>,
    pub protocol: Option<ProtocolInfo>,
    /// Responding standard parameters, in ascending PID order
    pub responding_standard: Vec<DiscoveredPid>,
    pub manufacturer_candidates: Vec<ManufacturerCandidate>,
    /// Parameters actually tested
    pub scanned: u32,
    /// Queries that failed at the transport level and were skipped over
    pub failed_queries: u32,
    /// Set when the connection failed before the scan completed
    pub partial: bool,
}

impl DiscoveryReport {
    pub fn new(protocol: Option<ProtocolInfo>) -> Self {
        Self {
            discovered_at: Utc::now(),
            protocol,
            responding_standard: Vec::new(),
            manufacturer_candidates: Vec::new(),
            scanned: 0,
            failed_queries: 0,
            partial: false,
        }
    }

    /// Project the responding ids back onto a registry, producing the set to
    /// monitor during capture
    pub fn monitored_set(&self, registry: &PidSet) -> PidSet {
        self.responding_standard
            .iter()
            .filter_map(|d| registry.get(&d.id).cloned())
            .collect()
    }
}
