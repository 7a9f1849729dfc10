//! Line framing with hard limits.
//!
//! [`LineFramer`] is a pure push/pop state machine so the limits can be
//! tested without sockets: bytes go in via [`LineFramer::push`], complete
//! frames come out via [`LineFramer::next_frame`]. Any error is fatal to
//! the connection that produced it; callers must stop feeding the framer
//! and tear the connection down.

use thiserror::Error;

use crate::limits::MAX_BUFFERED_BYTES;
use crate::limits::MAX_FRAME_BYTES;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("frame of {len} bytes exceeds the {limit}-byte message limit")]
    FrameTooLong { len: usize, limit: usize },
    #[error("{buffered} bytes buffered without a frame boundary (limit {limit})")]
    BufferOverflow { buffered: usize, limit: usize },
    #[error("frame is not valid UTF-8")]
    InvalidUtf8,
}

#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    /// Start of the first unconsumed byte; consumed prefix is compacted
    /// away once it outgrows the live tail.
    start: usize,
    max_frame: usize,
    max_buffered: usize,
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl LineFramer {
    pub fn new() -> Self {
        Self::with_limits(MAX_FRAME_BYTES, MAX_BUFFERED_BYTES)
    }

    pub fn with_limits(max_frame: usize, max_buffered: usize) -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            max_frame,
            max_buffered,
        }
    }

    /// Number of unconsumed bytes currently held.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Feed raw bytes from the connection.
    ///
    /// Fails when the unconsumed buffer would exceed the buffer cap, or
    /// when the trailing partial line alone already exceeds the message
    /// limit: a dripping, never-terminated line is caught here instead of
    /// growing until the buffer cap.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), FramingError> {
        let buffered = self.buffered() + bytes.len();
        if buffered > self.max_buffered {
            return Err(FramingError::BufferOverflow {
                buffered,
                limit: self.max_buffered,
            });
        }
        self.compact();
        self.buf.extend_from_slice(bytes);

        let tail_start = self.buf[self.start..]
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|pos| self.start + pos + 1)
            .unwrap_or(self.start);
        let partial = self.buf.len() - tail_start;
        if partial > self.max_frame {
            return Err(FramingError::FrameTooLong {
                len: partial,
                limit: self.max_frame,
            });
        }
        Ok(())
    }

    /// Pop the next complete frame, skipping blank lines. Returns `None`
    /// when no full line is buffered yet.
    pub fn next_frame(&mut self) -> Result<Option<String>, FramingError> {
        loop {
            let Some(pos) = self.buf[self.start..].iter().position(|&b| b == b'\n') else {
                return Ok(None);
            };
            let end = self.start + pos;
            let mut line = &self.buf[self.start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.len() > self.max_frame {
                return Err(FramingError::FrameTooLong {
                    len: line.len(),
                    limit: self.max_frame,
                });
            }
            let frame = match std::str::from_utf8(line) {
                Ok(text) => text.to_string(),
                Err(_) => return Err(FramingError::InvalidUtf8),
            };
            self.start = end + 1;
            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    fn compact(&mut self) {
        if self.start > 0 && self.start >= self.buf.len() - self.start {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}
