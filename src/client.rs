//! One-shot echo client.
//!
//! Connects, sends a single line, waits for the echo and disconnects. Used
//! by the `line-echo-client` binary as a manual test harness.

use crate::config::DEFAULT_PORT;
use clap::Parser;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{lookup_host, TcpStream};
use tracing::debug;

/// Host the client connects to by default.
pub const DEFAULT_CLIENT_HOST: &str = "127.0.0.1";

/// Command-line arguments for the echo client
#[derive(Parser, Debug)]
#[command(name = "line-echo-client")]
#[command(version)]
#[command(about = "Send one line to a line-echo server and print the echo", long_about = None)]
pub struct ClientArgs {
    /// Server host
    #[arg(default_value = DEFAULT_CLIENT_HOST)]
    pub host: String,

    /// Server port (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..), default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Message to send; read from stdin when omitted
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of one exchange with the server.
#[derive(Debug, PartialEq, Eq)]
pub enum Echo {
    /// Everything echoed back, newlines included.
    Line(Vec<u8>),
    /// The server closed the connection before echoing every line.
    Closed,
}

/// Terminate `message` with a newline unless it already is.
///
/// An empty message becomes a lone newline, which the server echoes back.
/// Embedded newlines are kept; each one ends a separate line on the wire.
pub fn frame_message(message: &str) -> Vec<u8> {
    let mut line = message.as_bytes().to_vec();
    if line.last() != Some(&b'\n') {
        line.push(b'\n');
    }
    line
}

/// Connect to `host:port`, trying each resolved address in turn.
pub async fn connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let resolve_err = |source| ClientError::Resolve {
        host: host.to_string(),
        port,
        source,
    };

    let mut last_err = None;
    for addr in lookup_host((host, port)).await.map_err(resolve_err)? {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(addr = %addr, "Connected");
                return Ok(stream);
            }
            Err(source) => last_err = Some(ClientError::Connect { addr, source }),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        resolve_err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "no addresses found",
        ))
    }))
}

/// Send framed lines and wait until every one of them has been echoed.
pub async fn exchange(stream: TcpStream, lines: &[u8]) -> Result<Echo, ClientError> {
    let (reader, mut writer) = stream.into_split();

    writer.write_all(lines).await?;
    writer.flush().await?;
    let expected = lines.iter().filter(|&&b| b == b'\n').count();
    debug!(bytes = lines.len(), lines = expected, "Sent");

    let mut reader = BufReader::new(reader);
    let mut echoed = Vec::with_capacity(lines.len());
    for _ in 0..expected {
        let n = reader.read_until(b'\n', &mut echoed).await?;
        debug!(bytes = n, "Received");

        // EOF before a newline means the server went away mid-echo.
        if n == 0 || echoed.last() != Some(&b'\n') {
            return Ok(Echo::Closed);
        }
    }
    Ok(Echo::Line(echoed))
}
