//! force_close tears a connection down immediately and the down callback
//! fires exactly once, also when a peer FIN races it.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use whorl::{EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

// Larger than any plausible socket send buffer, so part of the payload is
// still in the userspace output buffer when force_close discards it.
const PAYLOAD: usize = 8 * 1024 * 1024;

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

fn start_server(
    downs: Arc<AtomicUsize>,
    on_connect: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
) -> (EventLoop, std::net::SocketAddr, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        let server = TcpServer::bind(
            &event_loop,
            "127.0.0.1:0".parse().unwrap(),
            "closer",
            ServerOptions::default(),
        )
        .unwrap();

        let on_connect = Arc::new(on_connect);
        server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
            if conn.connected() {
                on_connect(conn);
            } else {
                downs.fetch_add(1, Ordering::SeqCst);
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
fn force_close_mid_write_fires_down_once() {
    let downs = Arc::new(AtomicUsize::new(0));
    let (event_loop, addr, server_thread) = start_server(downs.clone(), |conn| {
        // Queue more than the kernel will take, then drop it all.
        let payload = vec![0x11u8; PAYLOAD];
        conn.send(&payload);
        conn.force_close();
    });

    let mut client = TcpStream::connect(addr).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(2)))
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(2), || downs.load(Ordering::SeqCst) == 1),
        "down callback did not fire after force_close"
    );

    // The client sees a truncated stream: EOF, a reset, or at most the part
    // that was already in flight.
    let mut sink = vec![0u8; 64 * 1024];
    let mut total = 0usize;
    loop {
        match client.read(&mut sink) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(_) => break,
        }
    }
    assert!(total < PAYLOAD, "client read the whole payload: {total}");

    thread::sleep(Duration::from_millis(200));
    assert_eq!(downs.load(Ordering::SeqCst), 1);

    event_loop.quit();
    server_thread.join().unwrap();
}

#[test]
fn peer_fin_racing_delayed_force_close_fires_down_once() {
    let downs = Arc::new(AtomicUsize::new(0));
    let (event_loop, addr, server_thread) = start_server(downs.clone(), |conn| {
        conn.force_close_with_delay(Duration::from_millis(50));
    });

    // Close immediately: the FIN lands before the delayed force_close, whose
    // weak reference then resolves to a connection that is already down.
    let client = TcpStream::connect(addr).unwrap();
    drop(client);

    assert!(
        wait_until(Duration::from_secs(2), || downs.load(Ordering::SeqCst) == 1),
        "down callback did not fire after FIN"
    );
    thread::sleep(Duration::from_millis(300));
    assert_eq!(downs.load(Ordering::SeqCst), 1);

    event_loop.quit();
    server_thread.join().unwrap();
}
