//! whorl: a reactor-style TCP runtime.
//!
//! One event loop per I/O thread; each loop multiplexes its connections with
//! a level-triggered readiness poller, fires timers off a monotonic timerfd,
//! and runs tasks posted from other threads. All callbacks for a given
//! connection run on the same loop thread, sequentially.
//!
//! ```no_run
//! use whorl::{Buffer, EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! let event_loop = EventLoop::new().unwrap();
//! let server = TcpServer::bind(
//!     &event_loop,
//!     "127.0.0.1:7000".parse().unwrap(),
//!     "echo",
//!     ServerOptions::default(),
//! )
//! .unwrap();
//! server.set_message_callback(Arc::new(
//!     |conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant| {
//!         let data = buffer.retrieve_all_as_bytes();
//!         conn.send(&data);
//!     },
//! ));
//! server.start();
//! event_loop.run();
//! ```

pub(crate) mod acceptor;
pub mod buffer;
pub(crate) mod channel;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod metrics;
pub mod pool;
pub(crate) mod poller;
pub mod server;
pub mod socket;
pub mod timer;

pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, HighWaterMarkCallback, MessageCallback, TcpConnection, TcpConnectionPtr,
    WriteCompleteCallback, default_connection_callback, default_message_callback,
};
pub use error::Error;
pub use event_loop::EventLoop;
pub use pool::{EventLoopThreadPool, ThreadInitCallback};
pub use poller::USE_POLL_ENV;
pub use server::{ServerOptions, TcpServer};
pub use socket::is_self_connect;
pub use timer::TimerId;
