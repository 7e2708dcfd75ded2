//! Socket and fd plumbing shared by the acceptor, connections and event loops.

use std::io;
use std::net::{Shutdown, SocketAddr};
use std::os::fd::{FromRawFd, OwnedFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::warn;

/// Create a non-blocking TCP listener socket bound to `addr`.
///
/// `SO_REUSEADDR` is always set; `SO_REUSEPORT` only on request, so several
/// acceptors (possibly in different processes) can share one address.
/// The socket is bound but not yet listening.
pub(crate) fn bind_listener(addr: &SocketAddr, reuse_port: bool) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.bind(&SockAddr::from(*addr))?;
    Ok(socket)
}

/// Accept one connection, returning a non-blocking close-on-exec socket and
/// the peer address.
pub(crate) fn accept(listener: &Socket) -> io::Result<(Socket, SocketAddr)> {
    let (socket, addr) = listener.accept()?;
    socket.set_nonblocking(true)?;
    let peer = addr
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "peer address is not inet"))?;
    Ok((socket, peer))
}

/// Fetch the local address of a socket as an inet address.
pub(crate) fn local_addr(socket: &Socket) -> io::Result<SocketAddr> {
    socket
        .local_addr()?
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "local address is not inet"))
}

/// Drain and return the pending `SO_ERROR` value, 0 if none.
pub(crate) fn socket_error(socket: &Socket) -> i32 {
    match socket.take_error() {
        Ok(Some(err)) => err.raw_os_error().unwrap_or(0),
        Ok(None) => 0,
        Err(err) => err.raw_os_error().unwrap_or(0),
    }
}

/// Half-close the write side, leaving the read side open for the peer's
/// remaining data.
pub(crate) fn shutdown_write(socket: &Socket) {
    if let Err(err) = socket.shutdown(Shutdown::Write) {
        warn!("shutdown(SHUT_WR) failed: {err}");
    }
}

/// Detect the Linux self-connect artifact: a connect() to an address the
/// kernel resolved to our own ephemeral source port reports success with the
/// peer address equal to the local address. Such a connection is unusable and
/// callers should retry.
pub fn is_self_connect(socket: &Socket) -> bool {
    let local = socket.local_addr().ok().and_then(|a| a.as_socket());
    let peer = socket.peer_addr().ok().and_then(|a| a.as_socket());
    match (local, peer) {
        (Some(l), Some(p)) => l == p,
        _ => false,
    }
}

/// Create the eventfd used to wake a sleeping event loop from another thread.
pub(crate) fn new_event_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create the monotonic timerfd backing a timer queue.
pub(crate) fn new_timer_fd() -> io::Result<OwnedFd> {
    let fd = unsafe {
        libc::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_NONBLOCK | libc::TFD_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Open the reserve descriptor the acceptor keeps around for EMFILE recovery.
pub(crate) fn open_idle_fd() -> io::Result<OwnedFd> {
    let fd = unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
