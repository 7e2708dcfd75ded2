//! Accepts connections on a listening socket and hands them off.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use socket2::Socket;
use tracing::{error, warn};

use crate::channel::Channel;
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket;

pub(crate) type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr) + Send>;

pub(crate) struct Acceptor {
    event_loop: EventLoop,
    accept_socket: Socket,
    accept_channel: Arc<Channel>,
    local_addr: SocketAddr,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
    listening: AtomicBool,
    /// Reserve descriptor handed back to the kernel while draining the
    /// listen queue under EMFILE; see `handle_read`.
    idle_fd: Mutex<Option<OwnedFd>>,
}

impl Acceptor {
    pub(crate) fn new(
        event_loop: &EventLoop,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> Result<Arc<Acceptor>, Error> {
        let accept_socket = socket::bind_listener(listen_addr, reuse_port)?;
        let local_addr = socket::local_addr(&accept_socket)?;
        let idle_fd = socket::open_idle_fd()?;
        let accept_channel = Channel::new(event_loop, accept_socket.as_raw_fd());

        let acceptor = Arc::new(Acceptor {
            event_loop: event_loop.clone(),
            accept_socket,
            accept_channel,
            local_addr,
            new_connection_callback: Mutex::new(None),
            listening: AtomicBool::new(false),
            idle_fd: Mutex::new(Some(idle_fd)),
        });

        let weak = Arc::downgrade(&acceptor);
        acceptor.accept_channel.set_read_callback(move |_| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read();
            }
        });
        Ok(acceptor)
    }

    pub(crate) fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.new_connection_callback.lock().unwrap() = Some(callback);
    }

    pub(crate) fn listening(&self) -> bool {
        self.listening.load(Ordering::Relaxed)
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn listen(&self) {
        self.event_loop.assert_in_loop_thread();
        self.listening.store(true, Ordering::Relaxed);
        if let Err(err) = self.accept_socket.listen(libc::SOMAXCONN) {
            error!("Acceptor::listen on {}: {err}", self.local_addr);
            panic!("listen on {} failed: {err}", self.local_addr);
        }
        self.accept_channel.enable_reading();
    }

    fn handle_read(&self) {
        self.event_loop.assert_in_loop_thread();
        match socket::accept(&self.accept_socket) {
            Ok((socket, peer_addr)) => {
                metrics::CONNECTIONS_ACCEPTED.increment();
                let mut callback = self.new_connection_callback.lock().unwrap();
                match callback.as_mut() {
                    Some(callback) => callback(socket, peer_addr),
                    // No consumer; dropping the socket closes the fd.
                    None => drop(socket),
                }
            }
            Err(err) => {
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.raw_os_error() == Some(libc::EINTR)
                {
                    return;
                }
                metrics::ACCEPT_ERRORS.increment();
                error!("in Acceptor::handle_read: {err}");
                if err.raw_os_error() == Some(libc::EMFILE) {
                    self.drain_with_idle_fd();
                }
            }
        }
    }

    /// Out of descriptors: momentarily release the reserve fd, accept the
    /// excess connection with it and close it, then take the reserve back.
    /// Leaving the connection in the listen queue would keep the listen fd
    /// readable and busy-loop the reactor.
    fn drain_with_idle_fd(&self) {
        let mut idle = self.idle_fd.lock().unwrap();
        drop(idle.take());
        match self.accept_socket.accept() {
            Ok((excess, _)) => drop(excess),
            Err(err) => warn!("draining excess connection failed: {err}"),
        }
        match socket::open_idle_fd() {
            Ok(fd) => *idle = Some(fd),
            Err(err) => error!("re-opening idle fd failed: {err}"),
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        // Deregistration must happen on the loop thread; post it there when
        // the acceptor is dropped from anywhere else.
        let channel = self.accept_channel.clone();
        self.event_loop.run_in_loop(move || {
            channel.disable_all();
            channel.remove();
        });
    }
}
