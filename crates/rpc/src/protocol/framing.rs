//! Length-prefixed framing.
//!
//! A frame is a big-endian `u32` length followed by the header region and the
//! payload. The length counts the whole frame, prefix included.

use bytes::{Bytes, BytesMut};

use super::header::LENGTH_PREFIX_SIZE;
use crate::error::{Error, Result};

/// Maximum frame size (10MB by default).
pub const MAX_FRAME_SIZE: usize = 10 << 20;

/// Frames moved per readiness step on one connection.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// A frame being received.
///
/// Until the 4-byte prefix is in, bytes land in a small side buffer. Once the
/// declared length is known the whole frame is allocated up front and filled
/// in place.
#[derive(Debug, Default)]
pub struct InboundFrame {
    prefix: [u8; LENGTH_PREFIX_SIZE],
    buf: BytesMut,
    filled: usize,
}

impl InboundFrame {
    /// Whether no byte of the next frame has arrived yet.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Declared frame length, once the prefix is complete.
    #[must_use]
    pub fn declared_len(&self) -> Option<usize> {
        (!self.buf.is_empty()).then(|| self.buf.len())
    }

    /// Bytes received so far, prefix included.
    #[must_use]
    pub const fn filled(&self) -> usize {
        self.filled
    }

    /// Space the next read should fill.
    pub fn unfilled(&mut self) -> &mut [u8] {
        if self.filled < LENGTH_PREFIX_SIZE {
            &mut self.prefix[self.filled..]
        } else {
            &mut self.buf[self.filled..]
        }
    }

    /// Records `n` freshly read bytes and returns the frame once complete.
    ///
    /// # Errors
    ///
    /// Fails if the declared length exceeds `max_frame_size` or cannot even
    /// hold the prefix. The stream is unusable after that.
    pub fn advance(&mut self, n: usize, max_frame_size: usize) -> Result<Option<Bytes>> {
        self.filled += n;

        if self.buf.is_empty() {
            if self.filled < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let declared = u32::from_be_bytes(self.prefix) as usize;
            if declared > max_frame_size {
                return Err(Error::FrameTooLarge {
                    size: declared,
                    max: max_frame_size,
                });
            }
            if declared < LENGTH_PREFIX_SIZE {
                return Err(Error::InvalidFrame(format!(
                    "declared length {declared} is shorter than the prefix"
                )));
            }

            self.buf = BytesMut::zeroed(declared);
            self.buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&self.prefix);
        }

        if self.filled < self.buf.len() {
            return Ok(None);
        }

        self.filled = 0;
        Ok(Some(std::mem::take(&mut self.buf).freeze()))
    }
}

/// A frame queued for sending, with its write progress.
#[derive(Debug)]
pub struct OutboundFrame {
    buf: BytesMut,
    written: usize,
    patched: bool,
}

impl OutboundFrame {
    /// Wraps a marshalled buffer whose first bytes are the reserved prefix.
    ///
    /// # Errors
    ///
    /// Fails if the buffer is larger than `max_frame_size` or too short to
    /// carry a length prefix.
    pub fn new(buf: BytesMut, max_frame_size: usize) -> Result<Self> {
        if buf.len() > max_frame_size {
            return Err(Error::FrameTooLarge {
                size: buf.len(),
                max: max_frame_size,
            });
        }
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Err(Error::InvalidFrame(format!(
                "frame of {} bytes has no room for a length prefix",
                buf.len()
            )));
        }

        Ok(Self {
            buf,
            written: 0,
            patched: false,
        })
    }

    /// Total frame length.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Always false, frames carry at least their prefix.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes written so far.
    #[must_use]
    pub const fn written(&self) -> usize {
        self.written
    }

    /// Bytes still to write. Patches the length prefix on first use.
    #[allow(clippy::cast_possible_truncation)]
    pub fn unwritten(&mut self) -> &[u8] {
        if !self.patched {
            // Bounded by max_frame_size in `new`.
            let len = self.buf.len() as u32;
            self.buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&len.to_be_bytes());
            self.patched = true;
        }
        &self.buf[self.written..]
    }

    /// Records `n` written bytes, returning whether the frame is done.
    pub fn advance(&mut self, n: usize) -> bool {
        self.written += n;
        self.written >= self.buf.len()
    }
}
