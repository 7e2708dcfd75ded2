//! Echo every byte back to the peer.
//!
//! ```sh
//! cargo run --example echo_server
//! printf hello | nc 127.0.0.1 7000
//! ```

use std::sync::Arc;
use std::time::Instant;

use tracing_subscriber::EnvFilter;
use whorl::{Buffer, EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let event_loop = EventLoop::new().expect("event loop");
    let server = TcpServer::bind(
        &event_loop,
        "127.0.0.1:7000".parse().unwrap(),
        "echo",
        ServerOptions::default(),
    )
    .expect("bind 127.0.0.1:7000");

    server.set_thread_num(4);
    server.set_connection_callback(Arc::new(|conn: &TcpConnectionPtr| {
        println!(
            "echo: {} -> {} is {}",
            conn.peer_addr(),
            conn.local_addr(),
            if conn.connected() { "UP" } else { "DOWN" },
        );
    }));
    server.set_message_callback(Arc::new(
        |conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant| {
            let data = buffer.retrieve_all_as_bytes();
            conn.send(&data);
        },
    ));

    server.start();
    println!("echo server listening on {}", server.local_addr());
    event_loop.run();
}
