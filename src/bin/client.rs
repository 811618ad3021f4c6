//! line-echo-client: send one line to a line-echo server and print the echo.

use clap::Parser;
use line_echo::client::{self, ClientArgs, Echo};
use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = match ClientArgs::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let message = match args.message {
        Some(message) => message,
        None => match prompt() {
            Ok(message) => message,
            Err(e) => {
                eprintln!("line-echo-client: failed to read message: {e}");
                return ExitCode::FAILURE;
            }
        },
    };
    let line = client::frame_message(&message);

    let stream = match client::connect(&args.host, args.port).await {
        Ok(stream) => stream,
        Err(e) => {
            eprintln!("line-echo-client: {e}");
            return ExitCode::FAILURE;
        }
    };
    println!("Sent ({} bytes): {}", line.len(), String::from_utf8_lossy(&line).trim_end());

    match client::exchange(stream, &line).await {
        Ok(Echo::Line(echo)) => {
            println!(
                "Received echo ({} bytes): {}",
                echo.len(),
                String::from_utf8_lossy(&echo).trim_end()
            );
            ExitCode::SUCCESS
        }
        Ok(Echo::Closed) => {
            println!("Server closed the connection before echoing");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("line-echo-client: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Read one line from stdin, without its line ending.
fn prompt() -> io::Result<String> {
    print!("Enter message: ");
    io::stdout().flush()?;

    let mut message = String::new();
    io::stdin().lock().read_line(&mut message)?;
    Ok(message.trim_end_matches(['\r', '\n']).to_string())
}
