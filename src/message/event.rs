//! Application events, PD to CP.

use super::{Reader, put_bytes};
use crate::core::ProtocolError;

const EVENT_CARD_READ: u8 = 0x01;
const EVENT_KEY_PRESS: u8 = 0x02;

/// Card data framing reported with a card read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CardFormat {
    /// Format not specified by the reader.
    Unspecified = 0x00,
    /// Raw Wiegand bits.
    Wiegand = 0x01,
    /// ASCII card data.
    Ascii = 0x02,
}

impl CardFormat {
    /// Parse a card format from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Unspecified),
            0x01 => Some(Self::Wiegand),
            0x02 => Some(Self::Ascii),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One application event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A card was presented to a reader.
    CardRead {
        /// Reader number.
        reader_no: u8,
        /// Read direction reported by the reader.
        direction: u8,
        /// Card data framing.
        format: CardFormat,
        /// Raw card data.
        data: Vec<u8>,
    },
    /// Keypad digits were entered.
    KeyPress {
        /// Reader number.
        reader_no: u8,
        /// Entered digits.
        digits: Vec<u8>,
    },
}

impl Event {
    /// Append the wire encoding to `buf`.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Event::CardRead {
                reader_no,
                direction,
                format,
                data,
            } => {
                buf.push(EVENT_CARD_READ);
                buf.push(*reader_no);
                buf.push(*direction);
                buf.push(format.as_byte());
                put_bytes(buf, data);
            }
            Event::KeyPress { reader_no, digits } => {
                buf.push(EVENT_KEY_PRESS);
                buf.push(*reader_no);
                put_bytes(buf, digits);
            }
        }
    }

    /// Parse one event from the reader.
    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let kind = reader.u8()?;
        match kind {
            EVENT_CARD_READ => {
                let reader_no = reader.u8()?;
                let direction = reader.u8()?;
                let format = reader.u8()?;
                let format = CardFormat::from_byte(format).ok_or_else(|| {
                    ProtocolError::UnexpectedState(format!("unknown card format 0x{format:02x}"))
                })?;
                Ok(Event::CardRead {
                    reader_no,
                    direction,
                    format,
                    data: reader.bytes()?,
                })
            }
            EVENT_KEY_PRESS => Ok(Event::KeyPress {
                reader_no: reader.u8()?,
                digits: reader.bytes()?,
            }),
            other => Err(ProtocolError::UnexpectedState(format!(
                "unknown event kind 0x{other:02x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn test_card_read_roundtrip() {
        let message = Message::Event(Event::CardRead {
            reader_no: 1,
            direction: 1,
            format: CardFormat::Ascii,
            data: vec![9, 1, 9, 2, 6, 3, 1, 7, 7, 0],
        });
        assert_eq!(Message::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn test_key_press_roundtrip() {
        let message = Message::Event(Event::KeyPress {
            reader_no: 0,
            digits: vec![1, 2, 3, 4],
        });
        assert_eq!(Message::decode(&message.encode()).unwrap(), message);
    }

    #[test]
    fn test_unknown_event_kind_rejected() {
        let bytes = [0x42, 0x7F, 0x00];
        assert!(Message::decode(&bytes).is_err());
    }
}
