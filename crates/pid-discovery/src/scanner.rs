//! PID Scanner Implementation

use crate::report::{DiscoveredPid, DiscoveryReport, ManufacturerCandidate};
use ecu_connection::{ConnectionManager, ConnectionState, QueryError};
use obd_transport::{standard_registry, PidMode, PidSet};
use std::ops::RangeInclusive;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Scan tuning
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
    /// Also scan the manufacturer-specific Mode-21/22 candidate space
    pub include_manufacturer: bool,
    /// Delay between queries so the ECU is not overloaded
    pub inter_query_delay: Duration,
    /// Candidate PID range for the manufacturer modes
    pub manufacturer_pid_range: RangeInclusive<u8>,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            include_manufacturer: false,
            inter_query_delay: Duration::from_millis(75),
            manufacturer_pid_range: 0x00..=0x0F,
        }
    }
}

/// Scans the parameter space through a live connection
pub struct PidDiscovery {
    options: DiscoveryOptions,
    standard_space: PidSet,
}

impl PidDiscovery {
    /// Discovery over the built-in standard Mode-01 registry
    pub fn new(options: DiscoveryOptions) -> Self {
        Self {
            options,
            standard_space: standard_registry(),
        }
    }

    /// Discovery over a caller-supplied parameter space
    pub fn with_space(options: DiscoveryOptions, space: PidSet) -> Self {
        Self {
            options,
            standard_space: space,
        }
    }

    /// Run the scan. Pauses whenever the connection manager is busy
    /// recovering the link and resumes from the next untested parameter; a
    /// link that reaches a terminal state yields a partial report.
    pub async fn discover(&self, manager: &ConnectionManager) -> DiscoveryReport {
        let mut state_rx = manager.watch_state();
        let mut report = DiscoveryReport::new(manager.info().await.map(|i| i.protocol));
        if let Some(protocol) = &report.protocol {
            info!(
                protocol = %protocol.name,
                id = %protocol.id,
                port = %protocol.port,
                ecus = protocol.ecu_count,
                "protocol identified"
            );
        }

        info!(pids = self.standard_space.len(), "scanning standard Mode-01 space");
        let pids: Vec<_> = self.standard_space.iter().cloned().collect();
        let mut idx = 0;
        while idx < pids.len() {
            if !wait_until_queryable(&mut state_rx).await {
                warn!("connection lost for good; returning partial discovery report");
                report.partial = true;
                return report;
            }

            let pid = &pids[idx];
            match manager.query(pid).await {
                Ok(value) => {
                    debug!(pid = %pid.id, name = %pid.name, value = value.value, "responding");
                    report.responding_standard.push(DiscoveredPid {
                        id: pid.id.clone(),
                        name: pid.name.clone(),
                        unit: pid.unit.clone(),
                        value: value.value,
                    });
                }
                Err(QueryError::Decode { .. }) => {
                    debug!(pid = %pid.id, "no usable reply");
                }
                Err(QueryError::NotConnected(_)) => {
                    // state changed between the wait and the query; the
                    // parameter is still untested, so retry it after the
                    // next recovery
                    continue;
                }
                Err(QueryError::Transport(e)) => {
                    warn!(pid = %pid.id, error = %e, "query failed; continuing scan");
                    report.failed_queries += 1;
                }
            }

            report.scanned += 1;
            idx += 1;
            tokio::time::sleep(self.options.inter_query_delay).await;
        }

        info!(
            responding = report.responding_standard.len(),
            "standard scan complete"
        );

        if self.options.include_manufacturer {
            for mode in [PidMode::Manufacturer21, PidMode::Manufacturer22] {
                if !self
                    .scan_manufacturer_mode(manager, &mut state_rx, mode, &mut report)
                    .await
                {
                    report.partial = true;
                    return report;
                }
            }
        }

        report
    }

    /// Scan one manufacturer mode; returns false when the link died
    async fn scan_manufacturer_mode(
        &self,
        manager: &ConnectionManager,
        state_rx: &mut watch::Receiver<ConnectionState>,
        mode: PidMode,
        report: &mut DiscoveryReport,
    ) -> bool {
        info!(%mode, "scanning manufacturer-specific space");
        let candidates: Vec<u8> = self.options.manufacturer_pid_range.clone().collect();
        let mut idx = 0;
        while idx < candidates.len() {
            if !wait_until_queryable(state_rx).await {
                return false;
            }

            let pid = candidates[idx];
            match manager.query_raw(mode, pid).await {
                Ok(raw) if raw.has_payload() => {
                    let id = format!("{mode}{pid:02X}");
                    debug!(%id, raw = %raw.text, "manufacturer candidate");
                    report.manufacturer_candidates.push(ManufacturerCandidate {
                        id,
                        raw: raw.text,
                    });
                }
                Ok(_) => {}
                Err(QueryError::NotConnected(_)) => continue,
                Err(e) => {
                    debug!(%mode, pid = format!("{pid:02X}"), error = %e, "candidate query failed");
                    report.failed_queries += 1;
                }
            }

            report.scanned += 1;
            idx += 1;
            tokio::time::sleep(self.options.inter_query_delay).await;
        }
        true
    }
}

/// Wait until queries are allowed again; false when the connection reached a
/// terminal state
async fn wait_until_queryable(state_rx: &mut watch::Receiver<ConnectionState>) -> bool {
    loop {
        let state = *state_rx.borrow_and_update();
        if state.can_query() {
            return true;
        }
        if state.is_terminal() {
            return false;
        }
        if state_rx.changed().await.is_err() {
            return false;
        }
    }
}
