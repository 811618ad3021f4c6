//! line-echo: a line-oriented TCP echo server
//!
//! Features:
//! - Echoes every newline-terminated message back unmodified
//! - Single-threaded event loop (mio, or io_uring on Linux)
//! - Optional per-line length limit
//! - Graceful shutdown on Ctrl-C

use line_echo::{Config, Server, ShutdownHandle};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            // Usage errors go to stderr with exit code 1; --help/--version to stdout.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        runtime = %config.runtime,
        max_line_length = ?config.max_line_length,
        "Starting line-echo server"
    );

    let server = match Server::bind(&config) {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("line-echo: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = spawn_signal_listener(server.shutdown_handle()) {
        warn!(error = %e, "Ctrl-C handling unavailable");
    }

    match server.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Server failed");
            eprintln!("line-echo: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Stop the server on Ctrl-C.
///
/// The event loop owns the main thread, so the signal is awaited on a small
/// dedicated tokio runtime.
fn spawn_signal_listener(shutdown: ShutdownHandle) -> std::io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()?;

    std::thread::Builder::new()
        .name("signal".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl-C, shutting down");
                    if let Err(e) = shutdown.shutdown() {
                        error!(error = %e, "Failed to signal shutdown");
                    }
                }
            });
        })?;

    Ok(())
}
