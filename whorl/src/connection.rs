//! Per-connection state machine and buffers.
//!
//! A connection is created by the server in `Connecting` state, becomes
//! `Connected` once `connect_established` runs on its owning loop, moves to
//! `Disconnecting` on a user-initiated shutdown, and ends `Disconnected` when
//! the peer closes or a force-close lands. The "down" connection callback
//! fires exactly once, even when a peer FIN races a `force_close`.
//!
//! Ownership: the server's connection map holds one strong reference, tasks
//! posted across loops hold transient strong references, and the channel only
//! ties back weakly, so a dead connection drops its events instead of keeping
//! itself alive.

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use socket2::Socket;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::metrics;
use crate::socket;

/// Default output-buffer threshold for the high-watermark callback.
const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type TcpConnectionPtr = Arc<TcpConnection>;

/// Called on both the up and the down transition; distinguish with
/// [`TcpConnection::connected`].
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Called with the input buffer when bytes arrive; consume any prefix and
/// leave the rest for the next call.
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer, Instant) + Send + Sync>;
/// Called when the output buffer drains to empty.
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
/// Called once when the output buffer length crosses the configured
/// threshold from below.
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

pub fn default_connection_callback(conn: &TcpConnectionPtr) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" },
    );
    // No force_close here: registering only a message callback is fine.
}

pub fn default_message_callback(_conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant) {
    buffer.retrieve_all();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl State {
    fn from_u8(value: u8) -> State {
        match value {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }
}

#[derive(Default)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct TcpConnection {
    event_loop: EventLoop,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    input: Mutex<Buffer>,
    output: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    self_weak: Weak<TcpConnection>,
}

impl TcpConnection {
    /// Used by the server on accept; starts in `Connecting` until
    /// `connect_established` runs on the owning loop.
    pub(crate) fn new(
        event_loop: &EventLoop,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> TcpConnectionPtr {
        let channel = Channel::new(event_loop, socket.as_raw_fd());
        if let Err(err) = socket.set_keepalive(true) {
            warn!("SO_KEEPALIVE on {name}: {err}");
        }
        debug!("TcpConnection::new [{}] fd={}", name, socket.as_raw_fd());

        let conn = Arc::new_cyclic(|self_weak| TcpConnection {
            event_loop: event_loop.clone(),
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            channel,
            local_addr,
            peer_addr,
            input: Mutex::new(Buffer::new()),
            output: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
            context: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        let weak = conn.self_weak.clone();
        conn.channel.set_read_callback(move |receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(receive_time);
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_write_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write();
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_close_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close();
            }
        });
        let weak = conn.self_weak.clone();
        conn.channel.set_error_callback(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        });
        conn
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    /// The loop every callback of this connection runs on.
    pub fn get_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    /// Stash an arbitrary per-connection value, e.g. protocol state.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Borrow the context stashed with `set_context`, if it has type `T`.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.context.lock().unwrap();
        f(guard.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    /// Fires once per upward crossing of `threshold` bytes buffered for
    /// write; advisory backpressure, nothing blocks.
    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, threshold: usize) {
        self.high_water_mark.store(threshold, Ordering::Relaxed);
        self.callbacks.lock().unwrap().high_water_mark = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.callbacks.lock().unwrap().close = Some(callback);
    }

    /// Bytes currently queued for write.
    pub fn output_bytes(&self) -> usize {
        self.output.lock().unwrap().readable_bytes()
    }

    /// Send bytes to the peer. Thread-safe; off the owning loop the data is
    /// copied and the write happens on the loop. Sends after `shutdown` (or
    /// on a closed connection) are silently dropped.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = self.shared();
            let data = data.to_vec();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Send the readable contents of `buffer`, draining it.
    pub fn send_buffer(&self, buffer: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(buffer.peek());
            buffer.retrieve_all();
        } else {
            let conn = self.shared();
            let data = buffer.retrieve_all_as_bytes();
            self.event_loop.run_in_loop(move || conn.send_in_loop(&data));
        }
    }

    /// Half-close the write side once the output buffer drains. Reading
    /// continues until the peer closes its side.
    pub fn shutdown(&self) {
        if self.state() == State::Connected {
            self.set_state(State::Disconnecting);
            let conn = self.shared();
            self.event_loop.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    /// Close now, discarding anything still buffered for write.
    pub fn force_close(&self) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let conn = self.shared();
            self.event_loop.queue_in_loop(move || conn.force_close_in_loop());
        }
    }

    /// `force_close` after `delay`, unless the connection closed naturally
    /// first (the timer holds only a weak reference).
    pub fn force_close_with_delay(&self, delay: Duration) {
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            self.set_state(State::Disconnecting);
            let weak = self.self_weak.clone();
            self.event_loop.run_after(delay, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        if let Err(err) = self.socket.set_nodelay(on) {
            warn!("TCP_NODELAY on {}: {err}", self.name);
        }
    }

    /// Resume delivering message callbacks (the default state).
    pub fn start_read(&self) {
        let conn = self.shared();
        self.event_loop.run_in_loop(move || conn.start_read_in_loop());
    }

    /// Stop delivering message callbacks; bytes accumulate in the kernel and
    /// eventually backpressure the peer.
    pub fn stop_read(&self) {
        let conn = self.shared();
        self.event_loop.run_in_loop(move || conn.stop_read_in_loop());
    }

    /// Server-side half of the handshake with the user: flips to `Connected`
    /// and fires the up callback. Runs on the owning loop.
    pub(crate) fn connect_established(&self) {
        self.event_loop.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);
        metrics::CONNECTIONS_ACTIVE.increment();

        let conn = self.shared();
        self.channel.tie(&conn);
        self.channel.enable_reading();

        if let Some(cb) = self.connection_callback() {
            (*cb)(&conn);
        }
    }

    /// Final teardown, posted by the server after the map entry is gone.
    /// Fires the down callback only when `handle_close` did not already.
    pub(crate) fn connect_destroyed(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Connected {
            self.set_state(State::Disconnected);
            metrics::CONNECTIONS_ACTIVE.decrement();
            self.channel.disable_all();

            let conn = self.shared();
            if let Some(cb) = self.connection_callback() {
                (*cb)(&conn);
            }
        }
        self.channel.remove();
    }

    fn handle_read(&self, receive_time: Instant) {
        self.event_loop.assert_in_loop_thread();
        let message_cb = { self.callbacks.lock().unwrap().message.clone() };

        let mut input = self.input.lock().unwrap();
        let (n, saved_errno) = input.read_fd(self.channel.fd());
        if n > 0 {
            metrics::BYTES_RECEIVED.add(n as u64);
            match message_cb {
                Some(cb) => {
                    let conn = self.shared();
                    (*cb)(&conn, &mut input, receive_time);
                }
                None => input.retrieve_all(),
            }
        } else if n == 0 {
            drop(input);
            self.handle_close();
        } else {
            drop(input);
            if saved_errno == libc::EAGAIN || saved_errno == libc::EINTR {
                trace!("TcpConnection::handle_read [{}] transient errno {saved_errno}", self.name);
            } else {
                error!("TcpConnection::handle_read [{}] errno {saved_errno}", self.name);
                self.handle_error();
            }
        }
    }

    fn handle_write(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!("connection fd {} is down, no more writing", self.channel.fd());
            return;
        }
        let write_complete_cb = { self.callbacks.lock().unwrap().write_complete.clone() };

        let mut output = self.output.lock().unwrap();
        let n = unsafe {
            libc::write(
                self.channel.fd(),
                output.peek().as_ptr() as *const libc::c_void,
                output.readable_bytes(),
            )
        };
        if n > 0 {
            metrics::BYTES_SENT.add(n as u64);
            output.retrieve(n as usize);
            if output.readable_bytes() == 0 {
                self.channel.disable_writing();
                drop(output);
                if let Some(cb) = write_complete_cb {
                    let conn = self.shared();
                    self.event_loop.queue_in_loop(move || (*cb)(&conn));
                }
                // A shutdown issued while the buffer was draining half-closes
                // now that everything is out.
                if self.state() == State::Disconnecting {
                    self.shutdown_in_loop();
                }
            }
        } else {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("TcpConnection::handle_write [{}]: {err}", self.name);
            }
        }
    }

    fn handle_close(&self) {
        self.event_loop.assert_in_loop_thread();
        let state = self.state();
        if !matches!(state, State::Connected | State::Disconnecting) {
            // A peer FIN and a force_close can both arrive here; only the
            // first one runs the close path.
            return;
        }
        trace!("fd = {} state = {:?}", self.channel.fd(), state);
        self.set_state(State::Disconnected);
        metrics::CONNECTIONS_ACTIVE.decrement();
        self.channel.disable_all();

        // Keep ourselves alive: the close callback below erases the server's
        // strong reference.
        let conn = self.shared();
        let (connection_cb, close_cb) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.connection.clone(), cbs.close.clone())
        };
        if let Some(cb) = connection_cb {
            (*cb)(&conn);
        }
        // Must be last: hands the connection back to the server for removal.
        if let Some(cb) = close_cb {
            (*cb)(&conn);
        }
    }

    fn handle_error(&self) {
        let err = socket::socket_error(&self.socket);
        error!("TcpConnection::handle_error [{}] - SO_ERROR = {}", self.name, err);
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.event_loop.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("disconnected, give up writing");
            return;
        }
        let (write_complete_cb, high_water_cb) = {
            let cbs = self.callbacks.lock().unwrap();
            (cbs.write_complete.clone(), cbs.high_water_mark.clone())
        };

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;

        let mut output = self.output.lock().unwrap();
        // Nothing queued: try the socket directly and only buffer the tail.
        if !self.channel.is_writing() && output.readable_bytes() == 0 {
            let n = unsafe {
                libc::write(
                    self.channel.fd(),
                    data.as_ptr() as *const libc::c_void,
                    data.len(),
                )
            };
            if n >= 0 {
                nwrote = n as usize;
                metrics::BYTES_SENT.add(nwrote as u64);
                remaining = data.len() - nwrote;
                if remaining == 0 {
                    if let Some(cb) = write_complete_cb {
                        let conn = self.shared();
                        self.event_loop.queue_in_loop(move || (*cb)(&conn));
                    }
                }
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    error!("TcpConnection::send_in_loop [{}]: {err}", self.name);
                    if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET)) {
                        fault = true;
                    }
                }
            }
        }

        debug_assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                if let Some(cb) = high_water_cb {
                    let conn = self.shared();
                    let queued = old_len + remaining;
                    self.event_loop.queue_in_loop(move || (*cb)(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !self.channel.is_writing() {
                self.channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        // With writes still pending the half-close is deferred to
        // handle_write, after the buffer drains.
        if !self.channel.is_writing() {
            socket::shutdown_write(&self.socket);
        }
    }

    fn force_close_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if matches!(self.state(), State::Connected | State::Disconnecting) {
            // As if we had read a FIN.
            self.handle_close();
        }
    }

    fn start_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if !self.is_reading() || !self.channel.is_reading() {
            self.channel.enable_reading();
            self.reading.store(true, Ordering::Relaxed);
        }
    }

    fn stop_read_in_loop(&self) {
        self.event_loop.assert_in_loop_thread();
        if self.is_reading() || self.channel.is_reading() {
            self.channel.disable_reading();
            self.reading.store(false, Ordering::Relaxed);
        }
    }

    fn connection_callback(&self) -> Option<ConnectionCallback> {
        self.callbacks.lock().unwrap().connection.clone()
    }

    fn shared(&self) -> TcpConnectionPtr {
        self.self_weak.upgrade().expect("connection already destroyed")
    }

    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd={} state={:?}",
            self.name,
            self.channel.fd(),
            self.state(),
        );
    }
}
