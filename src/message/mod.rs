//! Wire message payloads: polls, commands, events, handshake steps.
//!
//! A [`Message`] is the unit carried by one frame payload (plaintext, or
//! the plaintext inside a secure block). CP-originated messages and
//! PD-originated replies share one closed enum so both codecs stay
//! symmetric.

mod command;
mod event;

pub use command::{Command, LedColor};
pub use event::{CardFormat, Event};

use crate::core::{CHALLENGE_SIZE, Capability, CapabilityFunction, PROOF_SIZE, ProtocolError};

// CP-to-PD message identifiers.
const MSG_POLL: u8 = 0x60;
const MSG_COMMAND: u8 = 0x61;
const MSG_CAP_REQUEST: u8 = 0x62;
const MSG_SC_INIT: u8 = 0x63;
const MSG_SC_FINISH: u8 = 0x64;

// PD-to-CP reply identifiers.
const REPLY_ACK: u8 = 0x40;
const REPLY_NAK: u8 = 0x41;
const REPLY_EVENT: u8 = 0x42;
const REPLY_CAPABILITIES: u8 = 0x43;
const REPLY_SC_REPLY: u8 = 0x44;

/// Reason code carried by a NAK reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NakCode {
    /// Payload could not be decoded.
    Malformed = 0x01,
    /// Sequence violation (replayed or out-of-order secure payload).
    SequenceError = 0x02,
    /// The request needs an active secure channel.
    SecurityRequired = 0x03,
    /// Authentication failed; the session is torn down.
    SecurityFailed = 0x04,
    /// The device cannot accept more commands right now.
    Busy = 0x05,
}

impl NakCode {
    /// Parse a NAK code from a byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Malformed),
            0x02 => Some(Self::SequenceError),
            0x03 => Some(Self::SecurityRequired),
            0x04 => Some(Self::SecurityFailed),
            0x05 => Some(Self::Busy),
            _ => None,
        }
    }

    /// Convert to the wire byte.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// One protocol message, CP-bound or PD-bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// CP: keepalive poll, also the vehicle for event collection.
    Poll,
    /// CP: deliver one application command.
    Command(Command),
    /// CP: request the device's capability set.
    CapabilityRequest,
    /// CP: open a secure channel handshake.
    SecureInit {
        /// CP challenge nonce.
        cp_nonce: [u8; CHALLENGE_SIZE],
    },
    /// CP: close the handshake by proving base-key possession.
    SecureFinish {
        /// CP proof over both nonces.
        cp_proof: [u8; PROOF_SIZE],
    },
    /// PD: positive acknowledge with nothing to report.
    Ack,
    /// PD: negative acknowledge.
    Nak(NakCode),
    /// PD: one pending application event, piggybacked on a reply.
    Event(Event),
    /// PD: advertised capability set.
    Capabilities(Vec<Capability>),
    /// PD: handshake response with the PD nonce and proof.
    SecureReply {
        /// PD challenge nonce.
        pd_nonce: [u8; CHALLENGE_SIZE],
        /// PD proof over both nonces.
        pd_proof: [u8; PROOF_SIZE],
    },
}

impl Message {
    /// Whether this message is a PD-to-CP reply.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Message::Ack
                | Message::Nak(_)
                | Message::Event(_)
                | Message::Capabilities(_)
                | Message::SecureReply { .. }
        )
    }

    /// Serialize to payload bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        match self {
            Message::Poll => buf.push(MSG_POLL),
            Message::Command(cmd) => {
                buf.push(MSG_COMMAND);
                cmd.encode_into(&mut buf);
            }
            Message::CapabilityRequest => buf.push(MSG_CAP_REQUEST),
            Message::SecureInit { cp_nonce } => {
                buf.push(MSG_SC_INIT);
                buf.extend_from_slice(cp_nonce);
            }
            Message::SecureFinish { cp_proof } => {
                buf.push(MSG_SC_FINISH);
                buf.extend_from_slice(cp_proof);
            }
            Message::Ack => buf.push(REPLY_ACK),
            Message::Nak(code) => {
                buf.push(REPLY_NAK);
                buf.push(code.as_byte());
            }
            Message::Event(event) => {
                buf.push(REPLY_EVENT);
                event.encode_into(&mut buf);
            }
            Message::Capabilities(caps) => {
                buf.push(REPLY_CAPABILITIES);
                buf.push(caps.len() as u8);
                for cap in caps {
                    buf.push(cap.function.as_byte());
                    buf.push(cap.compliance);
                    buf.push(cap.num_items);
                }
            }
            Message::SecureReply { pd_nonce, pd_proof } => {
                buf.push(REPLY_SC_REPLY);
                buf.extend_from_slice(pd_nonce);
                buf.extend_from_slice(pd_proof);
            }
        }
        buf
    }

    /// Parse a message from payload bytes.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let mut reader = Reader::new(payload);
        let id = reader.u8()?;
        let message = match id {
            MSG_POLL => Message::Poll,
            MSG_COMMAND => Message::Command(Command::decode_from(&mut reader)?),
            MSG_CAP_REQUEST => Message::CapabilityRequest,
            MSG_SC_INIT => Message::SecureInit {
                cp_nonce: reader.array()?,
            },
            MSG_SC_FINISH => Message::SecureFinish {
                cp_proof: reader.array()?,
            },
            REPLY_ACK => Message::Ack,
            REPLY_NAK => {
                let code = reader.u8()?;
                Message::Nak(NakCode::from_byte(code).ok_or_else(|| {
                    ProtocolError::UnexpectedState(format!("unknown NAK code 0x{code:02x}"))
                })?)
            }
            REPLY_EVENT => Message::Event(Event::decode_from(&mut reader)?),
            REPLY_CAPABILITIES => {
                let count = reader.u8()? as usize;
                let mut caps = Vec::with_capacity(count);
                for _ in 0..count {
                    let function = reader.u8()?;
                    let function = CapabilityFunction::from_byte(function).ok_or_else(|| {
                        ProtocolError::UnexpectedState(format!(
                            "unknown capability function 0x{function:02x}"
                        ))
                    })?;
                    caps.push(Capability::new(function, reader.u8()?, reader.u8()?));
                }
                Message::Capabilities(caps)
            }
            REPLY_SC_REPLY => Message::SecureReply {
                pd_nonce: reader.array()?,
                pd_proof: reader.array()?,
            },
            other => {
                return Err(ProtocolError::UnexpectedState(format!(
                    "unknown message id 0x{other:02x}"
                )));
            }
        };
        reader.finish()?;
        Ok(message)
    }
}

/// Bounds-checked cursor over a message payload.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.data.len() - self.pos < len {
            return Err(ProtocolError::UnexpectedState(
                "message payload too short".into(),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, ProtocolError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, ProtocolError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Read a u16-length-prefixed byte string.
    pub(crate) fn bytes(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Reject trailing bytes after a complete message.
    fn finish(&self) -> Result<(), ProtocolError> {
        if self.pos != self.data.len() {
            return Err(ProtocolError::UnexpectedState(
                "trailing bytes after message".into(),
            ));
        }
        Ok(())
    }
}

/// Append a u16-length-prefixed byte string.
pub(crate) fn put_bytes(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u16).to_le_bytes());
    buf.extend_from_slice(data);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScbkKey;

    fn roundtrip(message: Message) {
        let encoded = message.encode();
        assert_eq!(Message::decode(&encoded).unwrap(), message);
    }

    #[test]
    fn test_plain_messages_roundtrip() {
        roundtrip(Message::Poll);
        roundtrip(Message::CapabilityRequest);
        roundtrip(Message::Ack);
        roundtrip(Message::Nak(NakCode::SecurityRequired));
    }

    #[test]
    fn test_handshake_messages_roundtrip() {
        roundtrip(Message::SecureInit {
            cp_nonce: [1, 2, 3, 4, 5, 6, 7, 8],
        });
        roundtrip(Message::SecureReply {
            pd_nonce: [8, 7, 6, 5, 4, 3, 2, 1],
            pd_proof: [0xAB; PROOF_SIZE],
        });
        roundtrip(Message::SecureFinish {
            cp_proof: [0xCD; PROOF_SIZE],
        });
    }

    #[test]
    fn test_command_message_roundtrip() {
        roundtrip(Message::Command(Command::Keyset {
            key_type: 1,
            key: ScbkKey::from_bytes([0x11; 16]),
        }));
    }

    #[test]
    fn test_capabilities_roundtrip() {
        roundtrip(Message::Capabilities(vec![
            Capability::new(CapabilityFunction::OutputControl, 1, 1),
            Capability::new(CapabilityFunction::LedControl, 2, 1),
        ]));
    }

    #[test]
    fn test_decode_rejects_unknown_id() {
        assert!(Message::decode(&[0xEE]).is_err());
    }

    #[test]
    fn test_decode_rejects_short_payload() {
        let mut bytes = Message::SecureInit {
            cp_nonce: [0; CHALLENGE_SIZE],
        }
        .encode();
        bytes.truncate(4);
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = Message::Ack.encode();
        bytes.push(0x00);
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn test_is_reply() {
        assert!(Message::Ack.is_reply());
        assert!(Message::Nak(NakCode::Busy).is_reply());
        assert!(!Message::Poll.is_reply());
        assert!(!Message::CapabilityRequest.is_reply());
    }
}
