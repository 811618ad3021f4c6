//! Listening socket setup shared by both backends.

use std::io;
use std::net::SocketAddr;

/// Pending connection queue length passed to `listen(2)`.
const BACKLOG: i32 = 1024;

/// Create a non-blocking TCP listener bound to `addr`.
///
/// `SO_REUSEADDR` lets a restarted server rebind while old connections are
/// still in `TIME_WAIT`.
pub fn bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // Non-blocking: no pending client means WouldBlock, not a hang.
        let err = listener.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_bind_in_use() {
        let first = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = first.local_addr().unwrap();

        // A live listener on the same port blocks the bind even with SO_REUSEADDR.
        assert!(bind(addr).is_err());
    }
}
