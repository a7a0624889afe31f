//! OBD-II Transport Boundary
//!
//! This crate owns the serial boundary to ELM327-compatible adapters and the
//! read-only command vocabulary the rest of the workspace is allowed to use.
//! Only data-read request modes can be expressed; clear-DTC and other control
//! modes have no representation here, so no caller can issue them.

mod command;
mod elm327;
mod error;
mod pid;
mod transport;

pub mod mock;

pub use command::{ObdCommand, PidMode};
pub use elm327::Elm327Transport;
pub use error::TransportError;
pub use pid::{standard_registry, DecodeFn, PidDescriptor, PidSet};
pub use transport::{PortSettings, ProtocolInfo, RawResponse, Transport, TransportHandle};
