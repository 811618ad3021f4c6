//! Server setup errors.
//!
//! Everything that can go wrong before the event loop starts serving is
//! reported here, so `main` can print it and exit non-zero. Failures inside
//! a session never surface as `ServerError`; they close that session only.

use crate::config::RuntimeType;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured host/port did not resolve to a socket address.
    #[error("invalid listen address '{addr}': {source}")]
    Resolve {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Socket creation, bind or listen failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The event loop could not be created (poll instance, ring, waker).
    #[error("failed to start {runtime} event loop: {source}")]
    Runtime {
        runtime: RuntimeType,
        #[source]
        source: io::Error,
    },

    /// The requested runtime does not exist on this platform.
    #[error("{0} runtime is not supported on this platform")]
    Unsupported(RuntimeType),

    /// The event loop itself failed while serving.
    #[error("event loop failed: {0}")]
    EventLoop(#[source] io::Error),
}
