//! Graceful shutdown drains queued writes before the FIN goes out.

use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use whorl::{EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

const PAYLOAD: usize = 256 * 1024;

fn read_to_eof(client: &mut TcpStream) -> Vec<u8> {
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut received = Vec::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        match client.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buffer[..n]),
            Err(err) => panic!("read before EOF failed: {err}"),
        }
    }
    received
}

fn start_server(
    on_connect: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
) -> (EventLoop, std::net::SocketAddr, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::bind(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "drain",
            ServerOptions::default(),
        )
        .unwrap();

        let on_connect = Arc::new(on_connect);
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if conn.connected() {
                on_connect(conn);
            }
        }));

        server.start();
        tx.send((event_loop.clone(), server.local_addr())).unwrap();
        event_loop.run();
        drop(server);
    });
    let (event_loop, addr) = rx.recv().unwrap();
    (event_loop, addr, handle)
}

#[test]
fn shutdown_flushes_queued_bytes_before_eof() {
    let (event_loop, addr, server_thread) = start_server(|conn| {
        let payload = vec![0x5au8; PAYLOAD];
        conn.send(&payload);
        conn.shutdown();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let received = read_to_eof(&mut client);
    assert_eq!(received.len(), PAYLOAD);
    assert!(received.iter().all(|&b| b == 0x5a));

    drop(client);
    event_loop.quit();
    server_thread.join().unwrap();
}

#[test]
fn sends_after_shutdown_are_dropped() {
    let (event_loop, addr, server_thread) = start_server(|conn| {
        conn.send(b"before");
        conn.shutdown();
        conn.send(b"after");
    });

    let mut client = TcpStream::connect(addr).unwrap();
    let received = read_to_eof(&mut client);
    assert_eq!(received, b"before");

    drop(client);
    event_loop.quit();
    server_thread.join().unwrap();
}
