//! Socket creation and non-blocking connect, mirroring
//! `original_source/src/net.c`'s `setup_socket()` / `connect_client_socket()`.

use crate::error::SetupError;
use crate::net::Endpoint;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::TcpListener;

/// Outcome of a non-blocking `connect()` attempt.
pub enum ConnectOutcome {
    /// Connected synchronously (rare, but possible for loopback).
    Connected,
    /// Connection in progress; caller must arm a WRITE-ready watcher and
    /// complete it via `getsockopt(SO_ERROR)` once the socket is writable.
    InProgress,
}

/// Create a non-blocking listening socket: `SO_REUSEADDR` + `SO_REUSEPORT`,
/// bound to `endpoint`, listening with the OS default backlog.
///
/// On any failure all partial state is closed (dropping `Socket` closes
/// the underlying fd).
pub fn create_listener(endpoint: &Endpoint) -> Result<TcpListener, SetupError> {
    let domain = if endpoint.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&endpoint.addr().into())?;
    // OS default backlog, matching listen(fd, SOMAXCONN) in the original.
    socket.listen(libc::SOMAXCONN)?;

    Ok(socket.into())
}

/// Create a non-blocking TCP socket for an outbound (client) connection.
/// Does not connect; see [`begin_connect`].
pub fn create_client_socket(endpoint: &Endpoint) -> Result<Socket, SetupError> {
    let domain = if endpoint.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Issue a non-blocking `connect()` to `endpoint` on `socket`.
///
/// Retries on `EINTR`. A `WouldBlock`/`EINPROGRESS` result becomes
/// `Ok(ConnectOutcome::InProgress)`: the caller arms a WRITE-ready
/// watcher and completes the connection via `getsockopt(SO_ERROR)`.
pub fn begin_connect(socket: &Socket, endpoint: &Endpoint) -> io::Result<ConnectOutcome> {
    loop {
        match socket.connect(&endpoint.addr().into()) {
            Ok(()) => return Ok(ConnectOutcome::Connected),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Ok(ConnectOutcome::InProgress)
            }
            Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => {
                return Ok(ConnectOutcome::InProgress)
            }
            Err(e) => return Err(e),
        }
    }
}

/// Query `SO_ERROR` on a socket whose non-blocking `connect()` just
/// became writable. `Ok(())` means the connection succeeded.
pub fn take_socket_error(socket: &socket2::SockRef<'_>) -> io::Result<()> {
    match socket.take_error()? {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
