//! Newline framing for the echo protocol.
//!
//! TCP delivers a byte stream, not messages: one read may carry half a line,
//! or several lines at once. `FramedBuffer` accumulates whatever the socket
//! hands us and peels off complete records one at a time.
//!
//! A record is everything up to and including the `\n` delimiter. The
//! delimiter stays part of the record, so an empty line is the one-byte
//! record `"\n"` rather than "nothing".

use bytes::{Bytes, BytesMut};
use thiserror::Error;

/// Record delimiter for the wire protocol.
pub const DELIMITER: u8 = b'\n';

/// Initial buffer capacity.
const INITIAL_CAPACITY: usize = 4096;

/// Framing errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// More than `limit` bytes buffered without a delimiter.
    #[error("record exceeds {limit} bytes without a newline")]
    RecordTooLong { limit: usize },
}

/// Incremental accumulator that yields delimiter-terminated records.
#[derive(Debug)]
pub struct FramedBuffer {
    buf: BytesMut,
    /// Bytes at the front of `buf` already known to contain no delimiter.
    scanned: usize,
    max_record_len: Option<usize>,
}

impl FramedBuffer {
    /// Create an unbounded buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
            scanned: 0,
            max_record_len: None,
        }
    }

    /// Create a buffer that rejects records longer than `limit` bytes
    /// (delimiter included).
    pub fn with_limit(limit: usize) -> Self {
        Self {
            max_record_len: Some(limit),
            ..Self::new()
        }
    }

    /// Append received bytes at the tail.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Take the next complete record off the front, delimiter included.
    ///
    /// Returns `Ok(None)` without consuming anything when no delimiter has
    /// arrived yet.
    pub fn try_take_record(&mut self) -> Result<Option<Bytes>, FrameError> {
        let found = self.buf[self.scanned..]
            .iter()
            .position(|&b| b == DELIMITER);

        match found {
            Some(offset) => {
                let end = self.scanned + offset + 1;
                self.check_limit(end)?;
                self.scanned = 0;
                Ok(Some(self.buf.split_to(end).freeze()))
            }
            None => {
                self.scanned = self.buf.len();
                // A partial record that already reached the limit can never
                // complete within it.
                match self.max_record_len {
                    Some(limit) if self.buf.len() >= limit => {
                        Err(FrameError::RecordTooLong { limit })
                    }
                    _ => Ok(None),
                }
            }
        }
    }

    fn check_limit(&self, record_len: usize) -> Result<(), FrameError> {
        match self.max_record_len {
            Some(limit) if record_len > limit => Err(FrameError::RecordTooLong { limit }),
            _ => Ok(()),
        }
    }

    /// Number of buffered bytes not yet returned as a record.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any buffered partial record, returning how many bytes were lost.
    pub fn discard(&mut self) -> usize {
        let n = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        n
    }
}

impl Default for FramedBuffer {
    fn default() -> Self {
        Self::new()
    }
}
