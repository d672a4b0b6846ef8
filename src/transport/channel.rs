//! Transport channel abstraction and framed reads.
//!
//! The physical medium (RS-485, a UNIX socket, an in-memory pipe) is
//! abstracted as any byte-ordered duplex stream. Each protocol loop owns
//! its channel exclusively; the application never touches it.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use super::frame::Frame;
use crate::core::{FrameError, MAX_FRAME_SIZE, OsdpError, TransportError};

/// A byte-oriented duplex transport.
///
/// Blanket-implemented for every async byte stream, so `tokio::io::duplex`
/// pipes, TCP/UNIX sockets, and async serial ports all qualify.
pub trait Channel: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Channel for T {}

/// Accumulates raw channel bytes and yields complete frames.
///
/// Tolerates partial reads and leading garbage: bytes are buffered across
/// calls and the codec is re-invoked as more arrive.
pub(crate) struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Discard any buffered bytes (stale data from an aborted exchange).
    pub(crate) fn clear(&mut self) {
        self.buf.clear();
    }

    /// Drop bytes that precede the next SOM so line noise cannot grow the
    /// buffer without bound.
    fn discard_garbage(&mut self) {
        match self.buf.iter().position(|&b| b == crate::core::SOM) {
            Some(0) => {}
            Some(pos) => {
                self.buf.drain(..pos);
            }
            None => self.buf.clear(),
        }
    }

    /// Read one complete frame, waiting at most `wait`.
    ///
    /// Corrupt candidates are dropped byte-by-byte and scanning continues
    /// until the deadline. Returns [`TransportError::Timeout`] when the
    /// deadline passes and [`TransportError::Closed`] on end-of-stream.
    pub(crate) async fn read_frame(
        &mut self,
        channel: &mut Box<dyn Channel>,
        wait: Duration,
    ) -> Result<Frame, OsdpError> {
        let deadline = Instant::now() + wait;
        let mut chunk = [0u8; 256];
        loop {
            loop {
                match Frame::decode(&self.buf) {
                    Ok((frame, consumed)) => {
                        self.buf.drain(..consumed);
                        return Ok(frame);
                    }
                    Err(FrameError::Truncated) => {
                        self.discard_garbage();
                        break;
                    }
                    Err(err) => {
                        debug!("dropping corrupt byte while resyncing: {err}");
                        self.buf.drain(..1);
                    }
                }
            }

            let n = timeout_at(deadline, channel.read(&mut chunk))
                .await
                .map_err(|_| TransportError::Timeout)??;
            if n == 0 {
                return Err(TransportError::Closed.into());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

/// Write one frame and flush the channel.
pub(crate) async fn write_frame(
    channel: &mut Box<dyn Channel>,
    frame: &Frame,
) -> Result<(), OsdpError> {
    channel.write_all(&frame.encode()).await?;
    channel.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::Control;

    #[tokio::test]
    async fn test_read_frame_across_partial_writes() {
        let (mut near, far) = tokio::io::duplex(256);
        let mut far: Box<dyn Channel> = Box::new(far);
        let mut reader = FrameReader::new();

        let frame = Frame::new(3, Control::new(1), vec![0x60, 0x01, 0x02]);
        let bytes = frame.encode();
        let (first, rest) = bytes.split_at(4);

        near.write_all(first).await.unwrap();
        let pending = tokio::time::timeout(
            Duration::from_millis(20),
            reader.read_frame(&mut far, Duration::from_secs(1)),
        )
        .await;
        assert!(pending.is_err(), "must wait for the rest of the frame");

        near.write_all(rest).await.unwrap();
        let got = reader
            .read_frame(&mut far, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, frame);
    }

    #[tokio::test]
    async fn test_read_frame_times_out() {
        let (_near, far) = tokio::io::duplex(256);
        let mut far: Box<dyn Channel> = Box::new(far);
        let mut reader = FrameReader::new();

        let err = reader
            .read_frame(&mut far, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OsdpError::Transport(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_read_frame_reports_closed() {
        let (near, far) = tokio::io::duplex(256);
        let mut far: Box<dyn Channel> = Box::new(far);
        let mut reader = FrameReader::new();
        drop(near);

        let err = reader
            .read_frame(&mut far, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, OsdpError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_read_frame_recovers_from_garbage() {
        let (mut near, far) = tokio::io::duplex(256);
        let mut far: Box<dyn Channel> = Box::new(far);
        let mut reader = FrameReader::new();

        let frame = Frame::new(3, Control::new(0), vec![0x60]);
        // A fake SOM with a corrupt body, then the real frame.
        near.write_all(&[0x53, 0x03, 0x00, 0x08, 0x00, 0x60, 0xDE, 0xAD])
            .await
            .unwrap();
        near.write_all(&frame.encode()).await.unwrap();

        let got = reader
            .read_frame(&mut far, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(got, frame);
    }
}
