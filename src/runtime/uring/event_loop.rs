//! io_uring event loop for Linux.
//!
//! Completion-based model: accept, recv and send are submitted to the ring
//! and each completion is routed back by its token. Every session has at
//! most one operation in flight, and its slot in the connection table is
//! released only after that operation has completed, so the kernel never
//! writes into (or reads from) memory we have freed.
//!
//! Only the ring itself failing stops the loop. A submission that cannot be
//! queued closes the session it was for, and a failed accept or wakeup
//! re-arm is retried on the next turn.
//!
//! Buffers handed to the kernel stay put until the completion arrives: the
//! receive buffer is a boxed slice owned by the connection, and the record
//! being sent is a `Bytes` whose heap storage does not move when the slab
//! grows.

use super::eventfd::EventFd;
use super::token::{OpType, TokenAllocator};
use crate::runtime::session::{Action, Completion, Session};
use crate::runtime::ShutdownHandle;
use io_uring::{opcode, squeue, types, IoUring};
use slab::Slab;
use std::io;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Submission queue depth.
const RING_ENTRIES: u32 = 256;

/// Per-session receive buffer size.
const READ_CHUNK: usize = 16 * 1024;

/// `user_data` for cancel requests, whose completions carry no work.
const CANCEL_TOKEN: u64 = u64::MAX;

struct UringConnection {
    /// Owns the descriptor; dropping it closes the socket.
    stream: TcpStream,
    session: Session,
    read_buf: Box<[u8]>,
    /// Token of the operation the kernel currently holds, if any.
    in_flight: Option<u64>,
}

pub struct EventLoop {
    ring: IoUring,
    listener: std::net::TcpListener,
    wake: Arc<EventFd>,
    wake_buf: Box<[u8; 8]>,
    connections: Slab<UringConnection>,
    tokens: TokenAllocator,
    /// Whether an accept is queued on the listener.
    accept_armed: bool,
    /// Whether a read is queued on the wakeup eventfd.
    wake_armed: bool,
    max_line_length: Option<usize>,
    shutdown: ShutdownHandle,
}

impl EventLoop {
    pub fn new(
        listener: std::net::TcpListener,
        max_line_length: Option<usize>,
    ) -> io::Result<Self> {
        let ring = IoUring::new(RING_ENTRIES)?;

        // The ring parks blocking operations itself; a non-blocking listener
        // would just hand us EAGAIN.
        listener.set_nonblocking(false)?;

        let wake = Arc::new(EventFd::new()?);
        let shutdown = ShutdownHandle::event_fd(Arc::clone(&wake));

        Ok(Self {
            ring,
            listener,
            wake,
            wake_buf: Box::new([0u8; 8]),
            connections: Slab::with_capacity(1024),
            tokens: TokenAllocator::new(1024),
            accept_armed: false,
            wake_armed: false,
            max_line_length,
            shutdown,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn run(mut self) -> io::Result<()> {
        info!("Using io_uring runtime");

        self.submit_accept()?;
        self.submit_wake()?;

        loop {
            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            loop {
                let cqe = match self.ring.completion().next() {
                    Some(cqe) => cqe,
                    None => break,
                };
                self.dispatch(cqe.user_data(), cqe.result());
            }

            if self.shutdown.is_requested() {
                return self.drain();
            }
            self.rearm();
        }
    }

    /// Retry listener and wakeup submissions that could not be queued.
    fn rearm(&mut self) {
        if !self.accept_armed {
            if let Err(e) = self.submit_accept() {
                error!(error = %e, "Failed to re-arm accept, will retry");
            }
        }
        if !self.wake_armed {
            if let Err(e) = self.submit_wake() {
                error!(error = %e, "Failed to re-arm shutdown wakeup, will retry");
            }
        }
    }

    fn dispatch(&mut self, token: u64, result: i32) {
        if token == CANCEL_TOKEN {
            return;
        }

        let op = match self.tokens.free(token) {
            Some(op) => op,
            None => {
                warn!(token, "Unknown token in completion");
                return;
            }
        };

        match op {
            OpType::Accept => {
                self.accept_armed = false;
                self.on_accept(result);
            }
            OpType::Wake => self.wake_armed = false,
            OpType::Recv { conn_id } => self.on_recv(conn_id, result),
            OpType::Send { conn_id } => self.on_send(conn_id, result),
        }
    }

    fn on_accept(&mut self, result: i32) {
        if result >= 0 {
            // Safety: the kernel just handed us this descriptor; nothing else owns it.
            let stream = unsafe { TcpStream::from_raw_fd(result) };
            self.register(stream);
        } else {
            let err = io::Error::from_raw_os_error(-result);
            if !is_retryable(&err) {
                error!(error = %err, "Accept error");
            }
        }

        if self.shutdown.is_requested() {
            return;
        }
        if let Err(e) = self.submit_accept() {
            error!(error = %e, "Failed to re-arm accept, will retry");
        }
    }

    fn register(&mut self, stream: TcpStream) {
        let peer = match stream.peer_addr() {
            Ok(peer) => peer,
            Err(e) => {
                // Peer already gone; dropping the stream closes it.
                warn!(error = %e, "Accepted connection without peer address");
                return;
            }
        };

        let conn_id = self.connections.insert(UringConnection {
            stream,
            session: Session::new(peer, self.max_line_length),
            read_buf: vec![0u8; READ_CHUNK].into_boxed_slice(),
            in_flight: None,
        });

        info!(conn_id, peer = %peer, "Client connected");
        self.apply(conn_id, Action::Receive);
    }

    fn on_recv(&mut self, conn_id: usize, result: i32) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };
        conn.in_flight = None;

        let completion = if result >= 0 {
            Completion::Received(&conn.read_buf[..result as usize])
        } else {
            let err = io::Error::from_raw_os_error(-result);
            if is_retryable(&err) {
                return self.apply(conn_id, Action::Receive);
            }
            Completion::Failed(err)
        };

        let action = conn.session.handle(completion);
        self.apply(conn_id, action)
    }

    fn on_send(&mut self, conn_id: usize, result: i32) {
        let conn = match self.connections.get_mut(conn_id) {
            Some(conn) => conn,
            None => return,
        };
        conn.in_flight = None;

        let completion = if result >= 0 {
            Completion::Sent(result as usize)
        } else {
            let err = io::Error::from_raw_os_error(-result);
            if is_retryable(&err) {
                return self.apply(conn_id, Action::Send);
            }
            Completion::Failed(err)
        };

        let action = conn.session.handle(completion);
        self.apply(conn_id, action)
    }

    fn apply(&mut self, conn_id: usize, action: Action) {
        let submitted = match action {
            Action::Receive => self.submit_recv(conn_id),
            Action::Send => self.submit_send(conn_id),
            Action::Close(reason) => {
                if let Some(conn) = self.connections.get(conn_id) {
                    reason.log(conn_id, conn.session.peer());
                }
                self.release(conn_id);
                return;
            }
            Action::Idle => return,
        };

        if let Err(e) = submitted {
            self.abort(conn_id, e);
        }
    }

    /// Close a session whose next operation could not be submitted.
    fn abort(&mut self, conn_id: usize, err: io::Error) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            warn!(
                conn_id,
                peer = %conn.session.peer(),
                error = %err,
                "Submission failed, closing connection"
            );
            conn.session.shutdown();
        }
        self.release(conn_id);
    }

    /// Drop a closed session and its socket.
    fn release(&mut self, conn_id: usize) {
        if let Some(conn) = self.connections.get(conn_id) {
            if conn.in_flight.is_some() {
                // The kernel still holds one of its buffers; keep the slot.
                error!(conn_id, "Refusing to release session with an operation in flight");
                return;
            }
        }

        if let Some(conn) = self.connections.try_remove(conn_id) {
            debug!(
                conn_id,
                records = conn.session.records_echoed(),
                bytes = conn.session.bytes_received(),
                "Connection closed"
            );
        }
    }

    fn submit_accept(&mut self) -> io::Result<()> {
        let entry = opcode::Accept::new(
            types::Fd(self.listener.as_raw_fd()),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
        .build();

        self.submit(OpType::Accept, entry)?;
        self.accept_armed = true;
        Ok(())
    }

    fn submit_wake(&mut self) -> io::Result<()> {
        let entry = opcode::Read::new(
            types::Fd(self.wake.as_raw_fd()),
            self.wake_buf.as_mut_ptr(),
            self.wake_buf.len() as u32,
        )
        .build();

        self.submit(OpType::Wake, entry)?;
        self.wake_armed = true;
        Ok(())
    }

    fn submit_recv(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get_mut(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let entry = opcode::Recv::new(
            types::Fd(conn.stream.as_raw_fd()),
            conn.read_buf.as_mut_ptr(),
            conn.read_buf.len() as u32,
        )
        .build();

        let token = self.submit(OpType::Recv { conn_id }, entry)?;
        self.mark_in_flight(conn_id, token);
        Ok(())
    }

    fn submit_send(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = self
            .connections
            .get(conn_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "connection not found"))?;

        let outgoing = conn.session.outgoing();
        // Anything past u32::MAX goes out as a short write.
        let len = outgoing.len().min(u32::MAX as usize) as u32;

        let entry =
            opcode::Send::new(types::Fd(conn.stream.as_raw_fd()), outgoing.as_ptr(), len).build();

        let token = self.submit(OpType::Send { conn_id }, entry)?;
        self.mark_in_flight(conn_id, token);
        Ok(())
    }

    fn mark_in_flight(&mut self, conn_id: usize, token: u64) {
        if let Some(conn) = self.connections.get_mut(conn_id) {
            conn.in_flight = Some(token);
        }
    }

    /// Queue `entry` under a fresh token. The token is returned to the
    /// allocator if the entry could not be queued.
    fn submit(&mut self, op: OpType, entry: squeue::Entry) -> io::Result<u64> {
        let token = self.tokens.alloc(op);
        match self.push(entry.user_data(token)) {
            Ok(()) => Ok(token),
            Err(e) => {
                self.tokens.free(token);
                Err(e)
            }
        }
    }

    fn push(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // Safety: every buffer an entry points at is owned by this loop and
        // is not freed until the matching completion has been reaped.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                // Queue full: hand what we have to the kernel and retry.
                self.ring.submit()?;
                self.ring
                    .submission()
                    .push(&entry)
                    .map_err(|_| io::Error::new(io::ErrorKind::Other, "submission queue full"))?;
            }
        }
        Ok(())
    }

    /// Cancel every outstanding operation, wait for all of them to
    /// complete, then close the remaining sessions.
    fn drain(mut self) -> io::Result<()> {
        info!(
            connections = self.connections.len(),
            in_flight = self.tokens.len(),
            "Shutting down"
        );

        let mut to_cancel = self.tokens.in_flight();

        while !self.tokens.is_empty() {
            // Operations that completed on their own need no cancel.
            to_cancel.retain(|&token| self.tokens.contains(token));
            while let Some(&token) = to_cancel.last() {
                let cancel = opcode::AsyncCancel::new(token)
                    .build()
                    .user_data(CANCEL_TOKEN);
                if let Err(e) = self.push(cancel) {
                    // Reap some completions to make room, then carry on.
                    debug!(error = %e, "Cancel not queued yet");
                    break;
                }
                to_cancel.pop();
            }

            match self.ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            loop {
                let cqe = match self.ring.completion().next() {
                    Some(cqe) => cqe,
                    None => break,
                };
                if cqe.user_data() == CANCEL_TOKEN {
                    continue;
                }
                let conn_id = self.tokens.free(cqe.user_data()).and_then(OpType::conn_id);
                if let Some(conn) = conn_id.and_then(|id| self.connections.get_mut(id)) {
                    conn.in_flight = None;
                }
            }
        }

        let ids: Vec<usize> = self.connections.iter().map(|(id, _)| id).collect();
        for conn_id in ids {
            if let Some(conn) = self.connections.get_mut(conn_id) {
                let action = conn.session.shutdown();
                self.apply(conn_id, action);
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Errors that just mean "try the same operation again".
fn is_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
    )
}
