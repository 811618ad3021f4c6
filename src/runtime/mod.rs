//! Single-threaded event loop runtime for the echo server.
//!
//! Platform-specific backends:
//! - `mio_impl`: readiness-based I/O over epoll/kqueue (default, everywhere)
//! - `uring`: completion-based I/O over io_uring (Linux only)
//!
//! Both share common abstractions:
//! - `Session`: the per-connection echo state machine
//! - `listener::bind`: listening socket setup
//! - `ShutdownHandle`: wakes and stops a running loop
//!
//! A backend owns its listener (the acceptor role) and a slab of sessions.
//! Every accepted connection gets exactly one session, and the loop goes
//! straight back to accepting; a failing session is closed on its own
//! without disturbing the listener or any other session.

mod listener;
mod mio_impl;
pub mod session;
mod shutdown;

#[cfg(target_os = "linux")]
mod uring;

pub use session::{Action, CloseReason, Completion, Phase, Session};
pub use shutdown::ShutdownHandle;

use crate::config::{Config, RuntimeType};
use crate::error::ServerError;
use std::net::SocketAddr;
use tracing::info;

enum Backend {
    Mio(mio_impl::EventLoop),
    #[cfg(target_os = "linux")]
    Uring(uring::EventLoop),
}

/// A bound, ready-to-run echo server.
///
/// Binding and running are separate so callers can learn the actual port
/// (when binding port 0) and grab a shutdown handle before the loop takes
/// over the thread.
pub struct Server {
    backend: Backend,
    local_addr: SocketAddr,
    runtime: RuntimeType,
}

impl Server {
    /// Bind the listener and create the event loop.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;
        let listener =
            listener::bind(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let runtime = config.runtime;
        let runtime_err = |source| ServerError::Runtime { runtime, source };

        let backend = match runtime {
            RuntimeType::Mio => Backend::Mio(
                mio_impl::EventLoop::new(listener, config.max_line_length).map_err(runtime_err)?,
            ),
            #[cfg(target_os = "linux")]
            RuntimeType::IoUring => Backend::Uring(
                uring::EventLoop::new(listener, config.max_line_length).map_err(runtime_err)?,
            ),
            #[cfg(not(target_os = "linux"))]
            RuntimeType::IoUring => return Err(ServerError::Unsupported(runtime)),
        };

        Ok(Self {
            backend,
            local_addr,
            runtime,
        })
    }

    /// Address the listener is actually bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle that stops [`Server::run`] from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        match &self.backend {
            Backend::Mio(event_loop) => event_loop.shutdown_handle(),
            #[cfg(target_os = "linux")]
            Backend::Uring(event_loop) => event_loop.shutdown_handle(),
        }
    }

    /// Serve connections until shutdown is requested.
    pub fn run(self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr,
            runtime = %self.runtime,
            "Server listening"
        );

        let result = match self.backend {
            Backend::Mio(event_loop) => event_loop.run(),
            #[cfg(target_os = "linux")]
            Backend::Uring(event_loop) => event_loop.run(),
        };
        result.map_err(ServerError::EventLoop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct TestServer {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        thread: JoinHandle<Result<(), ServerError>>,
    }

    impl TestServer {
        fn stop(self) {
            self.shutdown.shutdown().unwrap();
            self.thread.join().unwrap().unwrap();
        }
    }

    /// Start a server on an ephemeral port. `None` if the backend cannot be
    /// created here (io_uring is often disabled in containers).
    fn start(runtime: RuntimeType, max_line_length: Option<usize>) -> Option<TestServer> {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            runtime,
            max_line_length,
            ..Config::default()
        };

        let server = match Server::bind(&config) {
            Ok(server) => server,
            Err(e @ (ServerError::Runtime { .. } | ServerError::Unsupported(_)))
                if runtime == RuntimeType::IoUring =>
            {
                eprintln!("skipping: {e}");
                return None;
            }
            Err(e) => panic!("bind failed: {e}"),
        };

        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let thread = std::thread::spawn(move || server.run());

        Some(TestServer {
            addr,
            shutdown,
            thread,
        })
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        timeout(WAIT, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed")
    }

    async fn read_exactly(stream: &mut TcpStream, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        timeout(WAIT, stream.read_exact(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        buf
    }

    /// True if nothing arrives within a short window.
    async fn stays_silent(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 64];
        timeout(Duration::from_millis(200), stream.read(&mut buf))
            .await
            .is_err()
    }

    async fn echo_hello(addr: SocketAddr) {
        let mut stream = connect(addr).await;
        stream.write_all(b"hello\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 6).await, b"hello\n");
    }

    async fn echo_separate_writes(addr: SocketAddr) {
        let mut stream = connect(addr).await;

        stream.write_all(b"a\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 2).await, b"a\n");

        stream.write_all(b"b\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 2).await, b"b\n");
    }

    async fn echo_empty_line(addr: SocketAddr) {
        let mut stream = connect(addr).await;
        stream.write_all(b"\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 1).await, b"\n");
    }

    async fn echo_pipelined(addr: SocketAddr) {
        let mut stream = connect(addr).await;
        let input = b"one\ntwo\n\nfour\n";
        stream.write_all(input).await.unwrap();
        assert_eq!(read_exactly(&mut stream, input.len()).await, input);
    }

    async fn echo_chunked(addr: SocketAddr) {
        let mut stream = connect(addr).await;

        for piece in [&b"spl"[..], b"it li", b"ne\nsec", b"ond\n"] {
            stream.write_all(piece).await.unwrap();
            stream.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(read_exactly(&mut stream, 18).await, b"split line\nsecond\n");
    }

    async fn no_echo_without_newline(addr: SocketAddr) {
        let mut stream = connect(addr).await;

        stream.write_all(b"waiting").await.unwrap();
        assert!(stays_silent(&mut stream).await);

        stream.write_all(b" done\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 13).await, b"waiting done\n");
    }

    async fn fragment_discarded_on_close(addr: SocketAddr) {
        let mut stream = connect(addr).await;
        stream.write_all(b"ok\npartial").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 3).await, b"ok\n");

        stream.shutdown().await.unwrap();

        // Server closes its side without echoing the fragment.
        let mut rest = Vec::new();
        timeout(WAIT, stream.read_to_end(&mut rest))
            .await
            .expect("server did not close")
            .unwrap();
        assert!(rest.is_empty());

        // And keeps serving new clients.
        echo_hello(addr).await;
    }

    async fn clients_isolated(addr: SocketAddr) {
        let mut a = connect(addr).await;
        let mut b = connect(addr).await;

        a.write_all(b"from a, part one ").await.unwrap();
        b.write_all(b"from b\n").await.unwrap();
        a.write_all(b"and two\n").await.unwrap();

        assert_eq!(read_exactly(&mut b, 7).await, b"from b\n");
        assert_eq!(
            read_exactly(&mut a, 25).await,
            b"from a, part one and two\n"
        );
        assert!(stays_silent(&mut a).await);
        assert!(stays_silent(&mut b).await);
    }

    async fn large_record(addr: SocketAddr) {
        let mut line: Vec<u8> = (0..256 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        line.push(b'\n');

        let stream = connect(addr).await;
        let (mut reader, mut writer) = stream.into_split();

        // Write and read concurrently so neither side's buffers fill up.
        let expected = line.clone();
        let writer_task = tokio::spawn(async move {
            writer.write_all(&line).await.unwrap();
            writer
        });

        let mut echoed = vec![0u8; expected.len()];
        timeout(WAIT, reader.read_exact(&mut echoed))
            .await
            .expect("read timed out")
            .unwrap();
        assert!(echoed == expected);

        drop(writer_task.await.unwrap());
    }

    async fn reset_client_does_not_affect_others(addr: SocketAddr) {
        let mut survivor = connect(addr).await;
        survivor.write_all(b"before\n").await.unwrap();
        assert_eq!(read_exactly(&mut survivor, 7).await, b"before\n");

        // Abort a connection mid-record with an RST instead of a FIN.
        let mut doomed = std::net::TcpStream::connect(addr).unwrap();
        doomed.write_all(b"half a line").unwrap();
        socket2::SockRef::from(&doomed)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(doomed);

        survivor.write_all(b"after\n").await.unwrap();
        assert_eq!(read_exactly(&mut survivor, 6).await, b"after\n");
        echo_hello(addr).await;
    }

    /// One client streams lines and reads its echoes as fast as it can while
    /// another connects and expects a prompt echo.
    async fn busy_client_does_not_starve_others(addr: SocketAddr) {
        let line: Vec<u8> = std::iter::repeat(b'x').take(63).chain([b'\n']).collect();
        let batch = line.repeat(1024);

        let (mut reader, mut writer) = connect(addr).await.into_split();
        let stop = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&stop);
        let flood = tokio::spawn(async move {
            let mut sent = 0usize;
            while !flag.load(Ordering::Relaxed) {
                if writer.write_all(&batch).await.is_err() {
                    break;
                }
                sent += batch.len();
            }
            // Dropping the write half sends FIN once the flood stops.
            sent
        });
        let drain = tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let mut received = 0usize;
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => received += n,
                }
            }
            received
        });

        // Let the flood saturate the loop before the second client arrives.
        tokio::time::sleep(Duration::from_millis(200)).await;
        echo_hello(addr).await;

        stop.store(true, Ordering::Relaxed);
        let sent = timeout(WAIT, flood).await.expect("flood did not stop").unwrap();
        let received = timeout(WAIT, drain).await.expect("echo did not finish").unwrap();
        assert!(sent > 0);
        assert_eq!(received, sent);
    }

    async fn all_scenarios(addr: SocketAddr) {
        echo_hello(addr).await;
        echo_separate_writes(addr).await;
        echo_empty_line(addr).await;
        echo_pipelined(addr).await;
        echo_chunked(addr).await;
        no_echo_without_newline(addr).await;
        fragment_discarded_on_close(addr).await;
        clients_isolated(addr).await;
        reset_client_does_not_affect_others(addr).await;
        large_record(addr).await;
    }

    #[tokio::test]
    async fn test_mio_echo() {
        let server = start(RuntimeType::Mio, None).unwrap();
        all_scenarios(server.addr).await;
        server.stop();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_uring_echo() {
        let Some(server) = start(RuntimeType::IoUring, None) else {
            return;
        };
        all_scenarios(server.addr).await;
        server.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_mio_busy_client_does_not_starve_others() {
        let server = start(RuntimeType::Mio, None).unwrap();
        busy_client_does_not_starve_others(server.addr).await;
        server.stop();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_uring_busy_client_does_not_starve_others() {
        let Some(server) = start(RuntimeType::IoUring, None) else {
            return;
        };
        busy_client_does_not_starve_others(server.addr).await;
        server.stop();
    }

    #[tokio::test]
    async fn test_line_limit_closes_connection() {
        let server = start(RuntimeType::Mio, Some(8)).unwrap();

        let mut stream = connect(server.addr).await;
        stream.write_all(b"short\n").await.unwrap();
        assert_eq!(read_exactly(&mut stream, 6).await, b"short\n");

        stream.write_all(b"much too long\n").await.unwrap();
        let mut rest = Vec::new();
        let closed = timeout(WAIT, stream.read_to_end(&mut rest))
            .await
            .expect("server did not close");
        // Either a clean EOF or a reset, but never an echo.
        if closed.is_ok() {
            assert!(rest.is_empty());
        }

        echo_hello(server.addr).await;
        server.stop();
    }

    #[tokio::test]
    async fn test_shutdown_with_open_connections() {
        let server = start(RuntimeType::Mio, None).unwrap();

        let mut idle = connect(server.addr).await;
        let mut busy = connect(server.addr).await;
        busy.write_all(b"unfinished").await.unwrap();
        echo_hello(server.addr).await;

        server.stop();

        let mut buf = Vec::new();
        let _ = timeout(WAIT, idle.read_to_end(&mut buf)).await.unwrap();
        let _ = timeout(WAIT, busy.read_to_end(&mut buf)).await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_bind_conflict_is_setup_error() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            ..Config::default()
        };

        assert!(matches!(
            Server::bind(&config),
            Err(ServerError::Bind { .. })
        ));
    }

    #[test]
    fn test_immediate_shutdown() {
        let server = start(RuntimeType::Mio, None).unwrap();
        // Requesting shutdown immediately must still let run() return.
        server.stop();
    }
}
