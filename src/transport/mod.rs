//! Transport layer: the channel abstraction and the frame codec.

mod channel;
mod frame;

pub use channel::Channel;
pub(crate) use channel::{FrameReader, write_frame};
pub use frame::{Control, Frame, crc16, header_bytes};
