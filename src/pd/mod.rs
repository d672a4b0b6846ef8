//! Peripheral device role: the polled slave end of the link.

mod device;

pub use device::{CommandReceiver, PdConfig, PdState, PeripheralDevice};
