//! Transport Error Types

use thiserror::Error;

/// Errors that can occur at the serial transport boundary
#[derive(Debug, Error)]
pub enum TransportError {
    /// Port could not be opened
    #[error("failed to open {port}: {reason}")]
    Open { port: String, reason: String },

    /// Serial I/O error on an open link
    #[error("serial I/O error: {0}")]
    Io(String),

    /// Timeout waiting for the adapter prompt
    #[error("timeout after {0}ms waiting for adapter response")]
    Timeout(u64),

    /// The handle was closed by a previous call
    #[error("transport handle is closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
