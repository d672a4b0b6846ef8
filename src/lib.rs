//! # OSDP Protocol
//!
//! Core engines for the **O**pen **S**upervised **D**evice **P**rotocol,
//! the master/slave wire protocol used between access-control panels and
//! door peripherals (card readers, output controllers) over a shared
//! half-duplex serial link. It provides:
//!
//! - **Framing**: self-describing, CRC-protected frames with resync
//! - **Security**: per-device secure channel with key exchange,
//!   authenticated encryption, and replay rejection
//! - **Scheduling**: round-robin polling of many devices over one channel
//!   with online/offline and secure-status tracking
//! - **Isolation**: the application touches only typed command/event
//!   queues and status queries, never protocol state
//!
//! ## Roles
//!
//! A [`cp::ControlPanel`] drives every registered device over one
//! [`transport::Channel`]; a [`pd::PeripheralDevice`] answers polls on its
//! own channel. Both spawn their protocol loop onto the ambient tokio
//! runtime and are torn down with `stop()`.
//!
//! ## Example
//!
//! ```ignore
//! use osdp_protocol::prelude::*;
//!
//! let key = ScbkKey::generate();
//! let devices = vec![PdInfo::new(101, "door-0").with_key(key)];
//! let (panel, mut events) = ControlPanel::start(channel, devices, CpConfig::default())?;
//!
//! panel.wait_sc_active(101, Some(Duration::from_secs(2))).await;
//! panel.send_command(101, Command::Output {
//!     output_no: 0,
//!     control_code: 1,
//!     timer_count: 10,
//! })?;
//!
//! while let Some(DeviceEvent { address, event }) = events.recv().await {
//!     println!("{address}: {event:?}");
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Core types (constants, errors, registration records)
pub mod core;

// Transport layer (channel abstraction, frame codec)
pub mod transport;

// Secure channel engine (key derivation, sessions)
pub mod secure;

// Wire messages (polls, commands, events, handshake steps)
pub mod message;

// Control panel role (poll scheduler)
pub mod cp;

// Peripheral device role (per-device state machine)
pub mod pd;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        Capability, CapabilityFunction, FrameError, OsdpError, PdFlags, PdInfo, ProtocolError,
        ScbkKey, SecurityError, TransportError,
    };
    pub use crate::cp::{ControlPanel, CpConfig, DeviceEvent, DeviceStatus, EventReceiver};
    pub use crate::message::{CardFormat, Command, Event, LedColor};
    pub use crate::pd::{CommandReceiver, PdConfig, PdState, PeripheralDevice};
    pub use crate::secure::ScStatus;
    pub use crate::transport::Channel;
}

// Re-export commonly used items at crate root
pub use crate::core::{Capability, CapabilityFunction, OsdpError, PdFlags, PdInfo, ScbkKey};
pub use cp::{ControlPanel, CpConfig, DeviceEvent, EventReceiver};
pub use message::{CardFormat, Command, Event, LedColor};
pub use pd::{CommandReceiver, PdConfig, PdState, PeripheralDevice};
pub use transport::Channel;
