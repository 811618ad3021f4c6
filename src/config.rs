//! Configuration for the line-echo server.
//!
//! Everything comes from the command line; there is no configuration file.
//! The only positional argument is the port, so `line-echo 7000` works the
//! way the classic echo demos do.

use crate::error::ServerError;
use clap::{Parser, ValueEnum};
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};

/// Port used when none is given.
pub const DEFAULT_PORT: u16 = 9999;

/// Address the server binds to by default (all IPv4 interfaces).
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Event loop backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RuntimeType {
    /// Readiness-based loop over epoll/kqueue.
    Mio,
    /// Completion-based loop over io_uring (Linux only).
    IoUring,
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeType::Mio => f.write_str("mio"),
            RuntimeType::IoUring => f.write_str("io-uring"),
        }
    }
}

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "line-echo")]
#[command(version)]
#[command(about = "A line-oriented TCP echo server", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..), default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind to
    #[arg(long, default_value = DEFAULT_HOST)]
    pub host: String,

    /// Event loop backend
    #[arg(short, long, value_enum, default_value_t = RuntimeType::Mio)]
    pub runtime: RuntimeType,

    /// Close connections that send a line longer than this many bytes
    #[arg(long, value_parser = parse_line_limit)]
    pub max_line_length: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

fn parse_line_limit(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    pub runtime: RuntimeType,
    pub max_line_length: Option<usize>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            runtime: RuntimeType::Mio,
            max_line_length: None,
            log_level: "info".to_string(),
        }
    }
}

impl From<CliArgs> for Config {
    fn from(cli: CliArgs) -> Self {
        Self {
            host: cli.host,
            port: cli.port,
            runtime: cli.runtime,
            max_line_length: cli.max_line_length,
            log_level: cli.log_level,
        }
    }
}

impl Config {
    /// Parse the process arguments.
    ///
    /// Returns the clap error untouched so the caller decides how to report
    /// it and which exit code to use.
    pub fn load() -> Result<Self, clap::Error> {
        CliArgs::try_parse().map(Config::from)
    }

    /// Resolve `host:port` to the address to bind.
    pub fn listen_addr(&self) -> Result<SocketAddr, ServerError> {
        let addr = format!("{}:{}", self.host, self.port);
        let resolve_err = |source| ServerError::Resolve {
            addr: addr.clone(),
            source,
        };

        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(resolve_err)?
            .next()
            .ok_or_else(|| {
                resolve_err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "no addresses found",
                ))
            })
    }
}
