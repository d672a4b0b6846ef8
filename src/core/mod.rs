//! Core types shared by every layer: constants, errors, and device
//! registration records.

mod constants;
mod error;
mod info;

pub use constants::*;
pub use error::{FrameError, OsdpError, ProtocolError, SecurityError, TransportError};
pub use info::{Capability, CapabilityFunction, PdFlags, PdInfo, ScbkKey};
