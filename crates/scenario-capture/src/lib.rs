//! Scenario Capture Scheduler
//!
//! Runs a session of named driving scenarios, sampling the monitored PID set
//! at a fixed cadence through the connection manager. The scheduler listens
//! to connection events while it samples: a degraded or reconnecting link
//! pauses sampling (ticks are recorded as skipped, never silently dropped),
//! a recovered link resumes it, and a terminally failed link truncates the
//! scenario and ends the session with whatever was captured.

mod scenario;
mod scheduler;
mod session;

pub use scenario::{ScenarioName, ScenarioSpec};
pub use scheduler::{
    AutoGate, CaptureOptions, NullSink, OperatorGate, ScenarioScheduler, ScenarioSink, SinkError,
};
pub use session::{
    PauseInterval, Reading, SampleBatch, ScenarioResult, ScenarioSummary, SessionMetadata,
    SessionStats, TickKind,
};
