//! Control panel role: the polling master end of the link.

mod device;
mod panel;
mod scheduler;

pub use panel::{ControlPanel, CpConfig, DeviceEvent, DeviceStatus, EventReceiver};
