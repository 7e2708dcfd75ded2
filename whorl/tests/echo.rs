//! End-to-end echo over loopback.
//!
//! Bytes round-trip verbatim, the connection callback fires exactly once in
//! each direction, and the per-connection callback order holds:
//! up < message* < down.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use whorl::{Buffer, EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

fn wait_until(limit: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn echo_roundtrip_with_single_up_and_down() {
    let ups = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));
    let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let (tx, rx) = mpsc::channel();
    let server_thread = {
        let ups = ups.clone();
        let downs = downs.clone();
        let events = events.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server = TcpServer::bind(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "echo",
                ServerOptions::default(),
            )
            .unwrap();

            let record = events.clone();
            server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                if conn.connected() {
                    ups.fetch_add(1, Ordering::SeqCst);
                    record.lock().unwrap().push("up");
                } else {
                    downs.fetch_add(1, Ordering::SeqCst);
                    record.lock().unwrap().push("down");
                }
            }));
            let record = events.clone();
            server.set_message_callback(Arc::new(
                move |conn: &TcpConnectionPtr, buffer: &mut Buffer, _when: Instant| {
                    record.lock().unwrap().push("message");
                    let data = buffer.retrieve_all_as_bytes();
                    conn.send(&data);
                },
            ));

            server.start();
            tx.send((event_loop.clone(), server.local_addr())).unwrap();
            event_loop.run();
            drop(server);
        })
    };

    let (event_loop, addr) = rx.recv().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    client.write_all(b"hello").unwrap();
    let mut echoed = [0u8; 5];
    client.read_exact(&mut echoed).unwrap();
    assert_eq!(&echoed, b"hello");
    drop(client);

    assert!(
        wait_until(Duration::from_secs(2), || downs.load(Ordering::SeqCst) == 1),
        "down callback did not fire"
    );
    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(downs.load(Ordering::SeqCst), 1);

    {
        let events = events.lock().unwrap();
        assert!(events.len() >= 3, "expected up/message/down, got {events:?}");
        assert_eq!(events.first(), Some(&"up"));
        assert_eq!(events.last(), Some(&"down"));
        assert!(events[1..events.len() - 1].iter().all(|e| *e == "message"));
    }

    event_loop.quit();
    server_thread.join().unwrap();
}

#[test]
fn send_is_thread_safe_from_foreign_threads() {
    let conn_slot: Arc<Mutex<Option<TcpConnectionPtr>>> = Arc::new(Mutex::new(None));

    let (tx, rx) = mpsc::channel();
    let server_thread = {
        let conn_slot = conn_slot.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server = TcpServer::bind(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "pusher",
                ServerOptions::default(),
            )
            .unwrap();

            server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                if conn.connected() {
                    *conn_slot.lock().unwrap() = Some(conn.clone());
                } else {
                    conn_slot.lock().unwrap().take();
                }
            }));

            server.start();
            tx.send((event_loop.clone(), server.local_addr())).unwrap();
            event_loop.run();
            drop(server);
        })
    };

    let (event_loop, addr) = rx.recv().unwrap();
    let mut client = TcpStream::connect(addr).unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || conn_slot.lock().unwrap().is_some()),
        "connection was not established"
    );

    // This thread is neither the acceptor loop nor an I/O loop; send must
    // hop to the owning loop.
    let conn = conn_slot.lock().unwrap().clone().unwrap();
    assert!(!conn.get_loop().is_in_loop_thread());
    conn.send(b"pushed");

    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();
    let mut received = [0u8; 6];
    client.read_exact(&mut received).unwrap();
    assert_eq!(&received, b"pushed");

    drop(client);
    event_loop.quit();
    server_thread.join().unwrap();
}
