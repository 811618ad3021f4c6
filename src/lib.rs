//! line-echo: a line-oriented TCP echo server.
//!
//! Clients send newline-terminated messages; the server writes each one back
//! byte-for-byte, newline included, in the order received.
//!
//! Layout:
//! - `framing`: splits the byte stream into newline-terminated records
//! - `runtime`: the per-connection session state machine and the
//!   single-threaded event loops (mio everywhere, io_uring on Linux)
//! - `config`: command-line configuration
//! - `client`: one-shot client used by the `line-echo-client` binary

pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod runtime;

pub use config::{Config, RuntimeType, DEFAULT_PORT};
pub use error::ServerError;
pub use runtime::{Server, ShutdownHandle};
