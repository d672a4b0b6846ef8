//! Error types for the OSDP protocol core.

use thiserror::Error;

/// Errors from the frame codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Not enough bytes for a complete frame; feed more and retry.
    #[error("incomplete frame, more bytes required")]
    Truncated,

    /// CRC mismatch or inconsistent length field.
    #[error("frame failed integrity check")]
    BadChecksum,

    /// Frame addressed to a device this side does not know.
    #[error("unknown device address: {0}")]
    UnknownAddress(u8),
}

/// Errors in the secure channel engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    /// Key exchange did not complete.
    #[error("secure channel handshake failed: {0}")]
    HandshakeFailed(String),

    /// Authentication tag verification failed.
    #[error("message authentication failed")]
    MacMismatch,

    /// Repeated or out-of-order sequence value.
    #[error("replay detected")]
    ReplayDetected,

    /// Key material was rejected (wrong length or refused by the peer).
    #[error("key rejected")]
    KeyRejected,
}

/// Protocol state-machine errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A message arrived that the current state cannot accept.
    #[error("unexpected protocol state: {0}")]
    UnexpectedState(String),

    /// A command was refused before transmission.
    #[error("command rejected: {0}")]
    CommandRejected(String),
}

/// Transport-level failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No reply within the bounded wait.
    #[error("transport timed out")]
    Timeout,

    /// The channel is gone or the protocol loop has stopped.
    #[error("transport closed")]
    Closed,
}

/// Top-level error type aggregating every layer.
#[derive(Debug, Error)]
pub enum OsdpError {
    /// Frame codec error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Secure channel error.
    #[error("security error: {0}")]
    Security(#[from] SecurityError),

    /// Protocol state error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// I/O error from the underlying channel.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
