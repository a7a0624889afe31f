//! Session Data Model

use crate::scenario::{ScenarioName, ScenarioSpec};
use chrono::{DateTime, Utc};
use ecu_connection::ConnectionState;
use obd_transport::ProtocolInfo;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// One parameter read at one tick. A failed read keeps its slot with
/// `valid = false` so the column layout of a scenario never shifts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub pid_id: String,
    pub timestamp: DateTime<Utc>,
    pub value: Option<f64>,
    pub valid: bool,
}

/// Whether a tick produced readings or fell inside a pause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    Sampled,
    Skipped,
}

/// Everything captured at one scheduler tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleBatch {
    pub tick: u32,
    pub timestamp: DateTime<Utc>,
    /// Elapsed time since the scenario started
    pub elapsed: Duration,
    pub kind: TickKind,
    /// One reading per monitored parameter; empty for skipped ticks
    pub readings: Vec<Reading>,
}

impl SampleBatch {
    pub fn skipped(tick: u32, elapsed: Duration) -> Self {
        Self {
            tick,
            timestamp: Utc::now(),
            elapsed,
            kind: TickKind::Skipped,
            readings: Vec::new(),
        }
    }
}

/// A contiguous run of ticks during which sampling was paused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseInterval {
    /// Connection state that opened the interval
    pub state: ConnectionState,
    pub from_tick: u32,
    /// Tick at which sampling resumed; `None` while still open or when the
    /// scenario ended inside the pause
    pub to_tick: Option<u32>,
}

/// The full record of one scenario run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioResult {
    pub spec: ScenarioSpec,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Monitored parameter ids, in sampling order
    pub pid_ids: Vec<String>,
    pub batches: Vec<SampleBatch>,
    pub pauses: Vec<PauseInterval>,
    /// Individual readings that failed inside sampled ticks
    pub failed_sample_count: u32,
    /// Times the link entered reconnection during this scenario
    pub reconnection_count: u32,
    /// Set when the scenario ended before its nominal duration
    pub truncated: bool,
}

impl ScenarioResult {
    pub fn new(spec: ScenarioSpec, pid_ids: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            spec,
            started_at: now,
            ended_at: now,
            pid_ids,
            batches: Vec::new(),
            pauses: Vec::new(),
            failed_sample_count: 0,
            reconnection_count: 0,
            truncated: false,
        }
    }

    pub(crate) fn open_pause(&mut self, state: ConnectionState, tick: u32) {
        self.pauses.push(PauseInterval {
            state,
            from_tick: tick,
            to_tick: None,
        });
    }

    pub(crate) fn close_pause(&mut self, tick: u32) {
        if let Some(last) = self.pauses.last_mut() {
            if last.to_tick.is_none() {
                last.to_tick = Some(tick);
            }
        }
    }

    pub fn sampled_ticks(&self) -> u32 {
        self.batches
            .iter()
            .filter(|b| b.kind == TickKind::Sampled)
            .count() as u32
    }

    pub fn skipped_ticks(&self) -> u32 {
        self.batches
            .iter()
            .filter(|b| b.kind == TickKind::Skipped)
            .count() as u32
    }

    pub fn summary(&self) -> ScenarioSummary {
        ScenarioSummary {
            name: self.spec.name,
            completed: !self.truncated,
            batches: self.batches.len() as u32,
            skipped_ticks: self.skipped_ticks(),
            reconnections: self.reconnection_count,
        }
    }
}

/// Per-scenario line in the session metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub name: ScenarioName,
    pub completed: bool,
    pub batches: u32,
    pub skipped_ticks: u32,
    pub reconnections: u32,
}

/// Session-wide counters
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStats {
    /// Sampled ticks across all scenarios
    pub total_samples: u64,
    /// Individual readings that failed inside sampled ticks
    pub failed_samples: u64,
    /// Reconnection episodes across all scenarios
    pub reconnections: u32,
}

/// Written once at the end of every session, complete or not
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub sampling_rate_hz: f64,
    pub protocol: Option<ProtocolInfo>,
    pub monitored_pids: Vec<String>,
    pub scenarios: Vec<ScenarioSummary>,
    pub stats: SessionStats,
    /// Set when the session ended before the plan was exhausted
    pub terminated_early: bool,
}
