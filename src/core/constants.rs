//! Protocol constants.
//!
//! Wire-format values are fixed by the protocol and MUST NOT be changed;
//! timing values are defaults that `CpConfig`/`PdConfig` may override.

use std::time::Duration;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Start-of-message marker, first byte of every frame.
pub const SOM: u8 = 0x53;

/// Frame header size (SOM + address + control + 2-byte length).
pub const HEADER_SIZE: usize = 5;

/// CRC-16 trailer size.
pub const CRC_SIZE: usize = 2;

/// Minimum frame size (header + 1-byte payload + CRC).
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + 1 + CRC_SIZE;

/// Maximum frame size accepted by either side.
pub const MAX_FRAME_SIZE: usize = 1024;

/// Mask extracting the 7-bit device address from the address byte.
pub const ADDRESS_MASK: u8 = 0x7F;

/// Address-byte flag marking a PD-to-CP reply frame.
pub const REPLY_FLAG: u8 = 0x80;

/// Highest assignable device address.
pub const MAX_ADDRESS: u8 = 0x7E;

/// Broadcast address (matched by every PD, never assignable).
pub const BROADCAST_ADDRESS: u8 = 0x7F;

/// Control-byte mask for the 2-bit link sequence.
pub const CONTROL_SEQ_MASK: u8 = 0x03;

/// Control-byte flag marking an encrypted payload.
pub const CONTROL_SECURE: u8 = 0x08;

// =============================================================================
// SECURE CHANNEL
// =============================================================================

/// Secure Channel Base Key (SCBK) size.
pub const SCBK_SIZE: usize = 16;

/// Well-known base key used while a device operates in install mode
/// (registered without a pre-shared key).
pub const SCBK_DEFAULT: [u8; SCBK_SIZE] = [
    0x30, 0x31, 0x32, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];

/// Handshake challenge nonce size (one per side).
pub const CHALLENGE_SIZE: usize = 8;

/// Handshake proof size (truncated HMAC-SHA256).
pub const PROOF_SIZE: usize = 16;

/// Derived session key size (XChaCha20 key).
pub const SESSION_KEY_SIZE: usize = 32;

/// Derived MAC key size (HMAC-SHA256 key).
pub const MAC_KEY_SIZE: usize = 32;

/// XChaCha20 nonce size.
pub const AEAD_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Sequence counter size carried in a secure payload (u64 LE).
pub const SEQUENCE_SIZE: usize = 8;

/// Fixed overhead of a secure payload over its plaintext.
pub const SECURE_OVERHEAD: usize = SEQUENCE_SIZE + AEAD_TAG_SIZE;

// =============================================================================
// TIMING & RETRY DEFAULTS
// =============================================================================

/// Per-device reply timeout on the CP side.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(200);

/// Pause between scheduler round-robin cycles.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Consecutive reply timeouts before a device is marked Offline.
pub const DEFAULT_OFFLINE_RETRY_COUNT: u32 = 3;

/// Delay before re-attempting a failed secure-channel handshake.
pub const DEFAULT_SC_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// PD-side channel read timeout (bounds each loop iteration).
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(100);

/// Depth of each per-device command queue.
pub const COMMAND_QUEUE_DEPTH: usize = 32;

/// Depth of the PD event queue and the CP event delivery queue.
pub const EVENT_QUEUE_DEPTH: usize = 32;
