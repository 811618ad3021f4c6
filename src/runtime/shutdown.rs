//! Cross-thread shutdown signal for an event loop.
//!
//! The loop blocks in the kernel, so setting a flag is not enough: the
//! handle also pokes a backend-specific wakeup source (a mio `Waker`, or an
//! eventfd the io_uring loop keeps a read posted on).

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[cfg(target_os = "linux")]
use crate::runtime::uring::EventFd;

#[derive(Clone)]
enum Notifier {
    Mio(Arc<mio::Waker>),
    #[cfg(target_os = "linux")]
    EventFd(Arc<EventFd>),
}

/// Requests that a running server stop.
///
/// Cloneable and `Send`; call [`ShutdownHandle::shutdown`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    notifier: Notifier,
}

impl ShutdownHandle {
    pub(crate) fn mio(waker: mio::Waker) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            notifier: Notifier::Mio(Arc::new(waker)),
        }
    }

    #[cfg(target_os = "linux")]
    pub(crate) fn event_fd(fd: Arc<EventFd>) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            notifier: Notifier::EventFd(fd),
        }
    }

    /// Ask the event loop to stop and wake it up.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        match &self.notifier {
            Notifier::Mio(waker) => waker.wake(),
            #[cfg(target_os = "linux")]
            Notifier::EventFd(fd) => fd.notify(),
        }
    }

    /// Whether shutdown has been requested.
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle")
            .field("requested", &self.is_requested())
            .finish()
    }
}
