//! TCP server facade: acceptor + loop pool + per-connection wiring.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use socket2::Socket;
use tracing::{info, warn};

use crate::acceptor::Acceptor;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, TcpConnectionPtr, WriteCompleteCallback,
    default_connection_callback, default_message_callback,
};
use crate::error::Error;
use crate::event_loop::EventLoop;
use crate::pool::{EventLoopThreadPool, ThreadInitCallback};
use crate::socket;

/// Knobs fixed at bind time.
#[derive(Clone, Default)]
pub struct ServerOptions {
    /// Set `SO_REUSEPORT` so several servers (or processes) can share the
    /// listen address.
    pub reuse_port: bool,
}

pub struct TcpServer {
    event_loop: EventLoop,
    ip_port: String,
    name: String,
    acceptor: Arc<Acceptor>,
    thread_pool: Arc<EventLoopThreadPool>,
    connection_callback: Mutex<ConnectionCallback>,
    message_callback: Mutex<MessageCallback>,
    write_complete_callback: Mutex<Option<WriteCompleteCallback>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
    started: AtomicBool,
    next_conn_id: AtomicU64,
    connections: Mutex<HashMap<String, TcpConnectionPtr>>,
    self_weak: Weak<TcpServer>,
}

impl TcpServer {
    /// Bind `listen_addr` (listening starts with [`start`](Self::start)).
    /// `event_loop` becomes the acceptor's loop.
    pub fn bind(
        event_loop: &EventLoop,
        listen_addr: SocketAddr,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> Result<Arc<TcpServer>, Error> {
        let name = name.into();
        let acceptor = Acceptor::new(event_loop, &listen_addr, options.reuse_port)?;
        let ip_port = acceptor.local_addr().to_string();

        let server = Arc::new_cyclic(|self_weak| TcpServer {
            event_loop: event_loop.clone(),
            ip_port,
            name: name.clone(),
            thread_pool: Arc::new(EventLoopThreadPool::new(event_loop, name)),
            acceptor,
            connection_callback: Mutex::new(Arc::new(default_connection_callback)),
            message_callback: Mutex::new(Arc::new(default_message_callback)),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
            started: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            self_weak: self_weak.clone(),
        });

        let weak = server.self_weak.clone();
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |socket, peer_addr| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(socket, peer_addr);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The bound address, with the kernel-assigned port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.acceptor.local_addr()
    }

    pub fn ip_port(&self) -> &str {
        &self.ip_port
    }

    /// The acceptor's loop.
    pub fn get_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    /// Number of I/O loops connections are spread over; zero keeps
    /// everything on the acceptor's loop. Call before `start`.
    pub fn set_thread_num(&self, num_threads: usize) {
        self.thread_pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, callback: ThreadInitCallback) {
        *self.thread_init_callback.lock().unwrap() = Some(callback);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        *self.connection_callback.lock().unwrap() = callback;
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_callback.lock().unwrap() = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        *self.write_complete_callback.lock().unwrap() = Some(callback);
    }

    /// Start the pool and the listener. Idempotent and callable from any
    /// thread; the actual work runs on the acceptor's loop.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(server) = self.self_weak.upgrade() else {
            return;
        };
        self.event_loop.run_in_loop(move || {
            let init = server.thread_init_callback.lock().unwrap().clone();
            if let Err(err) = server.thread_pool.start(init) {
                panic!("TcpServer [{}] failed to start workers: {err}", server.name);
            }
            assert!(!server.acceptor.listening());
            server.acceptor.listen();
            info!("TcpServer [{}] listening on {}", server.name, server.ip_port);
        });
    }

    /// Wire up a freshly accepted connection; runs on the acceptor's loop.
    fn new_connection(&self, connection_socket: Socket, peer_addr: SocketAddr) {
        self.event_loop.assert_in_loop_thread();
        let io_loop = self.thread_pool.get_next_loop();

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", self.name, self.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            self.name, conn_name, peer_addr
        );

        let local_addr = match socket::local_addr(&connection_socket) {
            Ok(addr) => addr,
            Err(err) => {
                warn!("getsockname for [{conn_name}]: {err}");
                drop(connection_socket);
                return;
            }
        };

        let conn = TcpConnection::new(
            &io_loop,
            conn_name.clone(),
            connection_socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback(self.connection_callback.lock().unwrap().clone());
        conn.set_message_callback(self.message_callback.lock().unwrap().clone());
        if let Some(cb) = self.write_complete_callback.lock().unwrap().clone() {
            conn.set_write_complete_callback(cb);
        }
        let weak = self.self_weak.clone();
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(server) = weak.upgrade() {
                server.remove_connection(conn);
            }
        }));

        self.connections
            .lock()
            .unwrap()
            .insert(conn_name, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    /// Runs on the connection's loop; hops to the acceptor's loop to drop
    /// the map entry, then back to the connection's loop for teardown.
    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        let Some(server) = self.self_weak.upgrade() else {
            return;
        };
        let conn = conn.clone();
        self.event_loop
            .run_in_loop(move || server.remove_connection_in_loop(&conn));
    }

    fn remove_connection_in_loop(&self, conn: &TcpConnectionPtr) {
        self.event_loop.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            self.name,
            conn.name()
        );
        let removed = self.connections.lock().unwrap().remove(conn.name());
        debug_assert!(removed.is_some());

        let io_loop = conn.get_loop().clone();
        let conn = conn.clone();
        io_loop.queue_in_loop(move || conn.connect_destroyed());
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        for (_, conn) in self.connections.lock().unwrap().drain() {
            let io_loop = conn.get_loop().clone();
            io_loop.run_in_loop(move || conn.connect_destroyed());
        }
    }
}
