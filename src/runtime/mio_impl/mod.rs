//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS). This is
//! the default backend and the only one available outside Linux.

mod event_loop;

pub use event_loop::EventLoop;
