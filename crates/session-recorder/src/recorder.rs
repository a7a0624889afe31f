//! Recorder Implementation

use async_trait::async_trait;
use chrono::Local;
use pid_discovery::DiscoveryReport;
use scenario_capture::{
    ScenarioResult, ScenarioSink, SessionMetadata, SinkError, TickKind,
};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("recorder i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("csv write error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json write error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes session artifacts under a data directory. The session directory is
/// created lazily on the first write, so a discovery-only run leaves no empty
/// session behind.
pub struct SessionRecorder {
    data_dir: PathBuf,
    session_dir: PathBuf,
}

impl SessionRecorder {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let session_dir = data_dir.join("sessions").join(stamp);
        Self {
            data_dir,
            session_dir,
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// One CSV per scenario: timestamp, elapsed, tick, status, then one
    /// column per monitored parameter. Skipped ticks and failed readings
    /// keep their rows with blank value cells.
    pub fn write_scenario(&self, result: &ScenarioResult) -> Result<PathBuf, RecorderError> {
        fs::create_dir_all(&self.session_dir)?;
        let path = self
            .session_dir
            .join(format!("{}.csv", result.spec.name.file_stem()));
        let mut writer = csv::Writer::from_path(&path)?;

        let mut header = vec![
            "timestamp".to_string(),
            "elapsed_s".to_string(),
            "tick".to_string(),
            "status".to_string(),
        ];
        header.extend(result.pid_ids.iter().cloned());
        writer.write_record(&header)?;

        for batch in &result.batches {
            let status = match batch.kind {
                TickKind::Sampled => "sampled",
                TickKind::Skipped => "skipped",
            };
            let mut row = vec![
                batch.timestamp.to_rfc3339(),
                format!("{:.3}", batch.elapsed.as_secs_f64()),
                batch.tick.to_string(),
                status.to_string(),
            ];
            for pid_id in &result.pid_ids {
                let cell = batch
                    .readings
                    .iter()
                    .find(|r| &r.pid_id == pid_id)
                    .and_then(|r| r.value)
                    .map(|v| format!("{v:.2}"))
                    .unwrap_or_default();
                row.push(cell);
            }
            writer.write_record(&row)?;
        }
        writer.flush()?;

        info!(
            scenario = %result.spec.name,
            rows = result.batches.len(),
            path = %path.display(),
            "scenario written"
        );
        Ok(path)
    }

    pub fn write_metadata(&self, metadata: &SessionMetadata) -> Result<PathBuf, RecorderError> {
        fs::create_dir_all(&self.session_dir)?;
        let path = self.session_dir.join("session_metadata.json");
        serde_json::to_writer_pretty(fs::File::create(&path)?, metadata)?;
        info!(path = %path.display(), "session metadata written");
        Ok(path)
    }

    /// Discovery output is session-independent: a JSON report plus a
    /// human-readable summary, both timestamped
    pub fn write_discovery(
        &self,
        report: &DiscoveryReport,
    ) -> Result<(PathBuf, PathBuf), RecorderError> {
        let dir = self.data_dir.join("discovery_results");
        fs::create_dir_all(&dir)?;
        let stamp = report.discovered_at.format("%Y%m%d_%H%M%S");

        let json_path = dir.join(format!("discovery_results_{stamp}.json"));
        serde_json::to_writer_pretty(fs::File::create(&json_path)?, report)?;

        let txt_path = dir.join(format!("discovery_summary_{stamp}.txt"));
        fs::write(&txt_path, render_summary(report))?;

        info!(
            responding = report.responding_standard.len(),
            json = %json_path.display(),
            summary = %txt_path.display(),
            "discovery report written"
        );
        Ok((json_path, txt_path))
    }
}

#[async_trait]
impl ScenarioSink for SessionRecorder {
    async fn record_scenario(&mut self, result: &ScenarioResult) -> Result<(), SinkError> {
        self.write_scenario(result)
            .map(drop)
            .map_err(|e| SinkError(e.to_string()))
    }

    async fn record_metadata(&mut self, metadata: &SessionMetadata) -> Result<(), SinkError> {
        self.write_metadata(metadata)
            .map(drop)
            .map_err(|e| SinkError(e.to_string()))
    }
}

fn render_summary(report: &DiscoveryReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "ECU Discovery Summary");
    let _ = writeln!(out, "=====================");
    let _ = writeln!(out, "Discovered: {}", report.discovered_at.to_rfc3339());
    match &report.protocol {
        Some(p) => {
            let _ = writeln!(
                out,
                "Protocol:   {} [id {}] on {}, {} ECU(s)",
                p.name, p.id, p.port, p.ecu_count
            );
        }
        None => {
            let _ = writeln!(out, "Protocol:   unknown");
        }
    }
    let _ = writeln!(
        out,
        "Scanned:    {} parameters, {} failed queries",
        report.scanned, report.failed_queries
    );
    if report.partial {
        let _ = writeln!(out, "PARTIAL:    scan ended early (connection lost)");
    }

    let _ = writeln!(
        out,
        "\nResponding standard parameters ({}):",
        report.responding_standard.len()
    );
    for pid in &report.responding_standard {
        let _ = writeln!(
            out,
            "  {}  {:<22} {:>10.2} {}",
            pid.id, pid.name, pid.value, pid.unit
        );
    }

    if !report.manufacturer_candidates.is_empty() {
        let _ = writeln!(
            out,
            "\nManufacturer candidates ({}):",
            report.manufacturer_candidates.len()
        );
        for candidate in &report.manufacturer_candidates {
            let _ = writeln!(out, "  {}  raw {}", candidate.id, candidate.raw);
        }
    }
    out
}
