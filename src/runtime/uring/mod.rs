//! Linux io_uring event loop implementation.
//!
//! Completion-based I/O: the loop submits accept/recv/send and reacts to
//! completions, which is the natural fit for the session state machine.

mod event_loop;
mod eventfd;
mod token;

pub use event_loop::EventLoop;
pub(crate) use eventfd::EventFd;
