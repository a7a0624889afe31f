//! PID Discovery Engine
//!
//! Determines which parameters the ECU actually answers: protocol
//! identification first, then a scan of the standard Mode-01 space, and
//! optionally the manufacturer-specific Mode-21/22 candidate space. The scan
//! pauses while the connection manager is reconnecting and resumes from the
//! next untested parameter, so a mid-scan link drop costs nothing already
//! learned.

mod report;
mod scanner;

pub use report::{DiscoveredPid, DiscoveryReport, ManufacturerCandidate};
pub use scanner::{DiscoveryOptions, PidDiscovery};
