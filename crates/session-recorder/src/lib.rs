//! Session Recorder
//!
//! Owns the on-disk layout for capture sessions and discovery runs:
//!
//! ```text
//! <data_dir>/
//!   sessions/<YYYYMMDD_HHMMSS>/
//!     <scenario>.csv
//!     session_metadata.json
//!   discovery_results/
//!     discovery_results_<ts>.json
//!     discovery_summary_<ts>.txt
//! ```
//!
//! Scenario CSVs keep one row per scheduler tick, skipped ticks included,
//! with blank cells for readings that never arrived.

mod recorder;

pub use recorder::{RecorderError, SessionRecorder};
