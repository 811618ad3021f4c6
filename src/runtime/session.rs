//! Per-connection echo state machine.
//!
//! A `Session` owns everything about one accepted connection except the
//! socket itself: the framing buffer, the record currently being echoed and
//! the lifecycle phase. It performs no I/O. The event loop submits the I/O
//! the session asks for and feeds each result back through
//! [`Session::handle`], which returns the next thing to do.
//!
//! ```text
//!            Received (no record)
//!              ┌──────────┐
//!              ▼          │
//!  new ──▶ Reading ───────┘
//!           │   ▲
//! record    │   │ record fully sent,
//! extracted │   │ nothing buffered
//!           ▼   │
//!          Writing ◀──┐ short write /
//!           │  └──────┘ next buffered record
//!           │
//!   EOF / error (from any phase)
//!           ▼
//!         Closed
//! ```

use crate::framing::{FrameError, FramedBuffer};
use bytes::{Buf, Bytes};
use std::io;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// Lifecycle phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for bytes from the peer.
    Reading,
    /// Echoing a record back to the peer.
    Writing,
    /// Terminal. No further operations are issued.
    Closed,
}

/// Result of an I/O operation the session asked for.
#[derive(Debug)]
pub enum Completion<'a> {
    /// A receive finished. Empty means the peer closed its side.
    Received(&'a [u8]),
    /// A send finished, accepting this many bytes.
    Sent(usize),
    /// The outstanding operation failed.
    Failed(io::Error),
}

/// What the event loop must do next for this session.
#[derive(Debug)]
pub enum Action {
    /// Issue a receive.
    Receive,
    /// Issue a send of [`Session::outgoing`].
    Send,
    /// Close the connection and release the session.
    Close(CloseReason),
    /// Session is already closed; nothing to do.
    Idle,
}

/// Why a session closed.
#[derive(Debug)]
pub enum CloseReason {
    /// Zero-length read. `discarded` counts bytes of an unterminated
    /// trailing fragment that were dropped.
    PeerClosed { discarded: usize },
    /// A receive or send failed.
    Io(io::Error),
    /// The peer exceeded the configured line length.
    Frame(FrameError),
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Log the close at a level matching its cause.
    pub fn log(&self, conn_id: usize, peer: SocketAddr) {
        match self {
            CloseReason::PeerClosed { discarded: 0 } => {
                info!(conn_id, peer = %peer, "Client disconnected");
            }
            CloseReason::PeerClosed { discarded } => {
                info!(
                    conn_id,
                    peer = %peer,
                    discarded_bytes = discarded,
                    "Client disconnected mid-line, fragment discarded"
                );
            }
            CloseReason::Io(e) => {
                warn!(conn_id, peer = %peer, error = %e, "Connection error");
            }
            CloseReason::Frame(e) => {
                warn!(conn_id, peer = %peer, error = %e, "Protocol error");
            }
            CloseReason::Shutdown => {
                debug!(conn_id, peer = %peer, "Connection closed for shutdown");
            }
        }
    }
}

/// State of one accepted connection.
#[derive(Debug)]
pub struct Session {
    peer: SocketAddr,
    phase: Phase,
    framer: FramedBuffer,
    /// Unsent remainder of the record being echoed.
    outgoing: Bytes,
    records_echoed: u64,
    bytes_received: u64,
}

impl Session {
    /// Create a session in the `Reading` phase.
    ///
    /// `max_line_length` bounds a single record; `None` means unbounded.
    pub fn new(peer: SocketAddr, max_line_length: Option<usize>) -> Self {
        let framer = match max_line_length {
            Some(limit) => FramedBuffer::with_limit(limit),
            None => FramedBuffer::new(),
        };

        Self {
            peer,
            phase: Phase::Reading,
            framer,
            outgoing: Bytes::new(),
            records_echoed: 0,
            bytes_received: 0,
        }
    }

    /// Advance the state machine with the result of the last operation.
    pub fn handle(&mut self, event: Completion<'_>) -> Action {
        if self.phase == Phase::Closed {
            return Action::Idle;
        }

        match event {
            Completion::Received(data) => self.on_received(data),
            Completion::Sent(n) => self.on_sent(n),
            Completion::Failed(e) => self.close(CloseReason::Io(e)),
        }
    }

    /// Force the session closed. Returns `Idle` if it already was.
    pub fn shutdown(&mut self) -> Action {
        if self.phase == Phase::Closed {
            return Action::Idle;
        }
        self.close(CloseReason::Shutdown)
    }

    fn on_received(&mut self, data: &[u8]) -> Action {
        if self.phase != Phase::Reading {
            return self.close(CloseReason::Io(io::Error::new(
                io::ErrorKind::Other,
                "receive completed while not reading",
            )));
        }

        if data.is_empty() {
            let discarded = self.framer.discard();
            return self.close(CloseReason::PeerClosed { discarded });
        }

        trace!(peer = %self.peer, bytes = data.len(), "Received");
        self.bytes_received += data.len() as u64;
        self.framer.append(data);
        self.next_record()
    }

    fn on_sent(&mut self, n: usize) -> Action {
        if self.phase != Phase::Writing {
            return self.close(CloseReason::Io(io::Error::new(
                io::ErrorKind::Other,
                "send completed while not writing",
            )));
        }

        if n == 0 && !self.outgoing.is_empty() {
            return self.close(CloseReason::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "send accepted zero bytes",
            )));
        }

        debug_assert!(n <= self.outgoing.len(), "sent more than was queued");
        self.outgoing.advance(n.min(self.outgoing.len()));

        if !self.outgoing.is_empty() {
            // Short write: resend the rest.
            return Action::Send;
        }

        self.records_echoed += 1;
        self.next_record()
    }

    /// Echo the next buffered record, or go back to reading.
    fn next_record(&mut self) -> Action {
        match self.framer.try_take_record() {
            Ok(Some(record)) => {
                debug!(peer = %self.peer, bytes = record.len(), "Echoing record");
                self.outgoing = record;
                self.phase = Phase::Writing;
                Action::Send
            }
            Ok(None) => {
                self.phase = Phase::Reading;
                Action::Receive
            }
            Err(e) => self.close(CloseReason::Frame(e)),
        }
    }

    fn close(&mut self, reason: CloseReason) -> Action {
        self.phase = Phase::Closed;
        self.outgoing = Bytes::new();
        Action::Close(reason)
    }

    /// Bytes still to be sent for the current record.
    ///
    /// Empty unless the session is `Writing`.
    pub fn outgoing(&self) -> &[u8] {
        &self.outgoing
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Remote address of the peer.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Records fully echoed so far.
    pub fn records_echoed(&self) -> u64 {
        self.records_echoed
    }

    /// Total bytes received so far.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}
