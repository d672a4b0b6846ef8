//! Application commands, CP to PD.
//!
//! Each kind is a struct variant with typed fields, so a malformed command
//! is a construction-time error rather than a runtime one.

use super::{Reader, put_bytes};
use crate::core::{ProtocolError, SCBK_SIZE, ScbkKey};

const CMD_OUTPUT: u8 = 0x01;
const CMD_BUZZER: u8 = 0x02;
const CMD_TEXT: u8 = 0x03;
const CMD_LED: u8 = 0x04;
const CMD_COMSET: u8 = 0x05;
const CMD_MFG: u8 = 0x06;
const CMD_KEYSET: u8 = 0x07;

/// LED color selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LedColor {
    /// Off.
    Black = 0x00,
    /// Red.
    Red = 0x01,
    /// Green.
    Green = 0x02,
    /// Amber.
    Amber = 0x03,
    /// Blue.
    Blue = 0x04,
}

impl LedColor {
    /// Parse an LED color from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(Self::Black),
            0x01 => Some(Self::Red),
            0x02 => Some(Self::Green),
            0x03 => Some(Self::Amber),
            0x04 => Some(Self::Blue),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One application command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Drive an output relay.
    Output {
        /// Output number on the device.
        output_no: u8,
        /// Activation control code.
        control_code: u8,
        /// Activation timer in centiseconds (0 = permanent).
        timer_count: u16,
    },
    /// Sound the audible annunciator.
    Buzzer {
        /// Reader number.
        reader: u8,
        /// Tone control code.
        control_code: u8,
        /// On time in centiseconds.
        on_count: u8,
        /// Off time in centiseconds.
        off_count: u8,
        /// Number of repetitions.
        rep_count: u8,
    },
    /// Show text on the device display.
    Text {
        /// Reader number.
        reader: u8,
        /// Display control code.
        control_code: u8,
        /// Temporary display time in seconds.
        temp_time: u8,
        /// Row offset of the first character.
        offset_row: u8,
        /// Column offset of the first character.
        offset_col: u8,
        /// Text to display.
        text: String,
    },
    /// Drive a reader LED.
    Led {
        /// Reader number.
        reader: u8,
        /// LED number on that reader.
        led_number: u8,
        /// Activation control code.
        control_code: u8,
        /// On time in centiseconds.
        on_count: u8,
        /// Off time in centiseconds.
        off_count: u8,
        /// Color while on.
        on_color: LedColor,
        /// Color while off.
        off_color: LedColor,
        /// Timer in centiseconds.
        timer_count: u16,
        /// Whether this is the temporary (vs. permanent) settings set.
        temporary: bool,
    },
    /// Reconfigure the device's address and baud rate.
    Comset {
        /// New device address.
        address: u8,
        /// New baud rate.
        baud_rate: u32,
    },
    /// Manufacturer-specific command.
    Manufacturer {
        /// IEEE OUI of the vendor.
        vendor_code: u32,
        /// Vendor command code.
        mfg_command: u8,
        /// Opaque vendor data.
        data: Vec<u8>,
    },
    /// Commit a new secure-channel base key. Secure-only.
    Keyset {
        /// Key type discriminator.
        key_type: u8,
        /// The new base key.
        key: ScbkKey,
    },
}

impl Command {
    /// Whether this command may only travel over an active secure channel.
    pub fn requires_secure(&self) -> bool {
        matches!(self, Command::Keyset { .. })
    }

    /// Append the wire encoding to `buf`.
    pub(crate) fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Command::Output {
                output_no,
                control_code,
                timer_count,
            } => {
                buf.push(CMD_OUTPUT);
                buf.push(*output_no);
                buf.push(*control_code);
                buf.extend_from_slice(&timer_count.to_le_bytes());
            }
            Command::Buzzer {
                reader,
                control_code,
                on_count,
                off_count,
                rep_count,
            } => {
                buf.push(CMD_BUZZER);
                buf.extend_from_slice(&[*reader, *control_code, *on_count, *off_count, *rep_count]);
            }
            Command::Text {
                reader,
                control_code,
                temp_time,
                offset_row,
                offset_col,
                text,
            } => {
                buf.push(CMD_TEXT);
                buf.extend_from_slice(&[*reader, *control_code, *temp_time, *offset_row, *offset_col]);
                put_bytes(buf, text.as_bytes());
            }
            Command::Led {
                reader,
                led_number,
                control_code,
                on_count,
                off_count,
                on_color,
                off_color,
                timer_count,
                temporary,
            } => {
                buf.push(CMD_LED);
                buf.extend_from_slice(&[
                    *reader,
                    *led_number,
                    *control_code,
                    *on_count,
                    *off_count,
                    on_color.as_byte(),
                    off_color.as_byte(),
                ]);
                buf.extend_from_slice(&timer_count.to_le_bytes());
                buf.push(u8::from(*temporary));
            }
            Command::Comset { address, baud_rate } => {
                buf.push(CMD_COMSET);
                buf.push(*address);
                buf.extend_from_slice(&baud_rate.to_le_bytes());
            }
            Command::Manufacturer {
                vendor_code,
                mfg_command,
                data,
            } => {
                buf.push(CMD_MFG);
                buf.extend_from_slice(&vendor_code.to_le_bytes());
                buf.push(*mfg_command);
                put_bytes(buf, data);
            }
            Command::Keyset { key_type, key } => {
                buf.push(CMD_KEYSET);
                buf.push(*key_type);
                buf.extend_from_slice(key.as_bytes());
            }
        }
    }

    /// Parse one command from the reader.
    pub(crate) fn decode_from(reader: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let kind = reader.u8()?;
        match kind {
            CMD_OUTPUT => Ok(Command::Output {
                output_no: reader.u8()?,
                control_code: reader.u8()?,
                timer_count: reader.u16()?,
            }),
            CMD_BUZZER => Ok(Command::Buzzer {
                reader: reader.u8()?,
                control_code: reader.u8()?,
                on_count: reader.u8()?,
                off_count: reader.u8()?,
                rep_count: reader.u8()?,
            }),
            CMD_TEXT => Ok(Command::Text {
                reader: reader.u8()?,
                control_code: reader.u8()?,
                temp_time: reader.u8()?,
                offset_row: reader.u8()?,
                offset_col: reader.u8()?,
                text: String::from_utf8(reader.bytes()?).map_err(|_| {
                    ProtocolError::UnexpectedState("text command is not UTF-8".into())
                })?,
            }),
            CMD_LED => Ok(Command::Led {
                reader: reader.u8()?,
                led_number: reader.u8()?,
                control_code: reader.u8()?,
                on_count: reader.u8()?,
                off_count: reader.u8()?,
                on_color: decode_color(reader.u8()?)?,
                off_color: decode_color(reader.u8()?)?,
                timer_count: reader.u16()?,
                temporary: reader.u8()? != 0,
            }),
            CMD_COMSET => Ok(Command::Comset {
                address: reader.u8()?,
                baud_rate: reader.u32()?,
            }),
            CMD_MFG => Ok(Command::Manufacturer {
                vendor_code: reader.u32()?,
                mfg_command: reader.u8()?,
                data: reader.bytes()?,
            }),
            CMD_KEYSET => Ok(Command::Keyset {
                key_type: reader.u8()?,
                key: ScbkKey::from_bytes(reader.array::<SCBK_SIZE>()?),
            }),
            other => Err(ProtocolError::UnexpectedState(format!(
                "unknown command kind 0x{other:02x}"
            ))),
        }
    }
}

fn decode_color(byte: u8) -> Result<LedColor, ProtocolError> {
    LedColor::from_byte(byte)
        .ok_or_else(|| ProtocolError::UnexpectedState(format!("unknown LED color 0x{byte:02x}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    fn roundtrip(command: Command) {
        let message = Message::Command(command);
        let encoded = message.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_output_roundtrip() {
        roundtrip(Command::Output {
            output_no: 0,
            control_code: 1,
            timer_count: 10,
        });
    }

    #[test]
    fn test_text_roundtrip() {
        roundtrip(Command::Text {
            reader: 0,
            control_code: 1,
            temp_time: 20,
            offset_row: 1,
            offset_col: 1,
            text: "OSDP".into(),
        });
    }

    #[test]
    fn test_led_roundtrip() {
        roundtrip(Command::Led {
            reader: 1,
            led_number: 0,
            control_code: 1,
            on_count: 10,
            off_count: 10,
            on_color: LedColor::Red,
            off_color: LedColor::Black,
            timer_count: 10,
            temporary: true,
        });
    }

    #[test]
    fn test_manufacturer_roundtrip() {
        roundtrip(Command::Manufacturer {
            vendor_code: 0x0003_0201,
            mfg_command: 13,
            data: vec![9, 1, 9, 2, 6, 3, 1, 7, 7, 0],
        });
    }

    #[test]
    fn test_only_keyset_requires_secure() {
        let keyset = Command::Keyset {
            key_type: 1,
            key: ScbkKey::generate(),
        };
        assert!(keyset.requires_secure());

        let output = Command::Output {
            output_no: 0,
            control_code: 1,
            timer_count: 10,
        };
        assert!(!output.requires_secure());
    }

    #[test]
    fn test_text_rejects_invalid_utf8() {
        let mut buf = vec![0x61, CMD_TEXT, 0, 1, 20, 1, 1];
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&[0xFF, 0xFE]);
        assert!(Message::decode(&buf).is_err());
    }
}
