//! Character-generator soak server in the spirit of RFC 864: streams a
//! rolling printable pattern as fast as the peer will take it, driven by the
//! write-complete callback, and prints throughput every few seconds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing_subscriber::EnvFilter;
use whorl::{Buffer, EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

fn pattern() -> Vec<u8> {
    let chars: Vec<u8> = (33u8..127).collect();
    let mut message = Vec::new();
    for shift in 0..chars.len() {
        for i in 0..72 {
            message.push(chars[(shift + i) % chars.len()]);
        }
        message.extend_from_slice(b"\r\n");
    }
    message
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let event_loop = EventLoop::new().expect("event loop");
    let server = TcpServer::bind(
        &event_loop,
        "127.0.0.1:7001".parse().unwrap(),
        "chargen",
        ServerOptions::default(),
    )
    .expect("bind 127.0.0.1:7001");

    let message = Arc::new(pattern());
    let transferred = Arc::new(AtomicU64::new(0));

    let payload = message.clone();
    let sent = transferred.clone();
    server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        if conn.connected() {
            conn.set_tcp_no_delay(true);
            sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
            conn.send(&payload);
        }
    }));
    let payload = message.clone();
    let sent = transferred.clone();
    server.set_write_complete_callback(Arc::new(move |conn: &TcpConnectionPtr| {
        sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        conn.send(&payload);
    }));
    server.set_message_callback(Arc::new(
        |_conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant| {
            buffer.retrieve_all();
        },
    ));

    server.start();
    println!("chargen server listening on {}", server.local_addr());

    event_loop.run_every(Duration::from_secs(3), move || {
        let bytes = transferred.swap(0, Ordering::Relaxed);
        println!("{:.3} MiB/s", bytes as f64 / (3.0 * 1024.0 * 1024.0));
    });
    event_loop.run();
}
