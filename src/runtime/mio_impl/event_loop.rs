//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then we
//! perform the non-blocking syscall the session is waiting on and feed the
//! result to it as a completion. Uses epoll on Linux, kqueue on macOS.
//!
//! Sockets are registered edge-triggered for both directions once. On any
//! event the session's pending operation is retried until the kernel says
//! `WouldBlock`, so no readiness edge is ever consumed without draining it.
//!
//! A connection gets at most `OPS_PER_WAKEUP` operations per turn. One that
//! still has work after that is deferred: edge triggering will not report it
//! again, so the loop polls without blocking and resumes it on the next turn,
//! after the listener and every other ready connection have been served.

use crate::runtime::session::{Action, Completion, Phase, Session};
use crate::runtime::ShutdownHandle;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Events fetched per poll.
const EVENTS_CAPACITY: usize = 1024;

/// Scratch read size, shared by all sessions on this loop.
const READ_CHUNK: usize = 16 * 1024;

/// Reads and writes one connection may perform before yielding.
const OPS_PER_WAKEUP: usize = 32;

struct MioConnection {
    stream: TcpStream,
    session: Session,
    /// Queued in `deferred` to resume without a new readiness event.
    deferred: bool,
}

pub struct EventLoop {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<MioConnection>,
    /// Connections that ran out of budget with work left.
    deferred: Vec<usize>,
    scratch: Vec<u8>,
    max_line_length: Option<usize>,
    shutdown: ShutdownHandle,
}

impl EventLoop {
    pub fn new(
        listener: std::net::TcpListener,
        max_line_length: Option<usize>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;

        let mut listener = TcpListener::from_std(listener);
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            poll,
            listener,
            connections: Slab::with_capacity(1024),
            deferred: Vec::new(),
            scratch: vec![0u8; READ_CHUNK],
            max_line_length,
            shutdown: ShutdownHandle::mio(waker),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn run(mut self) -> io::Result<()> {
        info!("Using mio runtime (epoll/kqueue)");
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        loop {
            let timeout = if self.deferred.is_empty() {
                None
            } else {
                Some(Duration::ZERO)
            };

            match self.poll.poll(&mut events, timeout) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    Token(conn_id) => self.drive_and_defer(conn_id),
                }
            }

            for conn_id in std::mem::take(&mut self.deferred) {
                match self.connections.get_mut(conn_id) {
                    Some(conn) if conn.deferred => conn.deferred = false,
                    _ => continue,
                }
                self.drive_and_defer(conn_id);
            }

            if self.shutdown.is_requested() {
                self.close_all();
                info!("Server stopped");
                return Ok(());
            }
        }
    }

    /// Accept until the backlog is empty.
    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let entry = self.connections.vacant_entry();
                    let conn_id = entry.key();

                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        Token(conn_id),
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "Failed to register connection");
                        continue;
                    }

                    entry.insert(MioConnection {
                        stream,
                        session: Session::new(peer, self.max_line_length),
                        deferred: false,
                    });
                    info!(conn_id, peer = %peer, "Client connected");
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if is_transient_accept_error(e) => {
                    warn!(error = %e, "Accept failed, continuing");
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Re-arm so the next pending connection still raises an event
                    // even though the backlog was not drained.
                    if let Err(e) = self.poll.registry().reregister(
                        &mut self.listener,
                        LISTENER_TOKEN,
                        Interest::READABLE,
                    ) {
                        error!(error = %e, "Failed to re-arm listener");
                    }
                    break;
                }
            }
        }
    }

    fn drive_and_defer(&mut self, conn_id: usize) {
        if !self.drive(conn_id) {
            return;
        }
        if let Some(conn) = self.connections.get_mut(conn_id) {
            if !conn.deferred {
                conn.deferred = true;
                self.deferred.push(conn_id);
            }
        }
    }

    /// Run a session's pending operation until it would block, the session
    /// closes, or the per-wakeup budget is spent.
    ///
    /// Returns `true` if the budget ran out with work possibly left.
    fn drive(&mut self, conn_id: usize) -> bool {
        for _ in 0..OPS_PER_WAKEUP {
            let conn = match self.connections.get_mut(conn_id) {
                Some(conn) => conn,
                None => return false,
            };

            let completion = match conn.session.phase() {
                Phase::Reading => match conn.stream.read(&mut self.scratch) {
                    Ok(n) => Completion::Received(&self.scratch[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Completion::Failed(e),
                },
                Phase::Writing => match conn.stream.write(conn.session.outgoing()) {
                    Ok(n) => Completion::Sent(n),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => Completion::Failed(e),
                },
                Phase::Closed => return false,
            };

            match conn.session.handle(completion) {
                // The next operation is attempted on the following iteration.
                Action::Receive | Action::Send => {}
                Action::Close(reason) => {
                    reason.log(conn_id, conn.session.peer());
                    self.close_connection(conn_id);
                    return false;
                }
                Action::Idle => return false,
            }
        }
        true
    }

    fn close_connection(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.connections.try_remove(conn_id) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            debug!(
                conn_id,
                records = conn.session.records_echoed(),
                bytes = conn.session.bytes_received(),
                "Connection closed"
            );
            // Dropping `conn` closes the socket.
        }
    }

    fn close_all(&mut self) {
        info!(connections = self.connections.len(), "Shutting down");

        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                if let Action::Close(reason) = conn.session.shutdown() {
                    reason.log(conn_id, conn.session.peer());
                }
            }
            self.close_connection(conn_id);
        }
    }
}

/// Accept failures caused by a single client that has already gone away.
fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
