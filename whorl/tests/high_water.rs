//! High-watermark callback: fires exactly once when the output buffer
//! crosses the threshold from below, with the queued length reported.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use whorl::{EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

const THRESHOLD: usize = 1024 * 1024;
const CHUNK: usize = 64 * 1024;
// Far beyond what the kernel's socket buffers can absorb, so the output
// buffer is guaranteed to cross the threshold while the client is not
// reading.
const CHUNKS: usize = 512;

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
fn high_water_mark_fires_once_with_queued_length() {
    let hits = Arc::new(AtomicUsize::new(0));
    let reported = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let server_thread = {
        let hits = hits.clone();
        let reported = reported.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server = TcpServer::bind(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "firehose",
                ServerOptions::default(),
            )
            .unwrap();

            server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                if !conn.connected() {
                    return;
                }
                let hits = hits.clone();
                let reported = reported.clone();
                conn.set_high_water_mark_callback(
                    Arc::new(move |_conn: &TcpConnectionPtr, queued: usize| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        reported.store(queued, Ordering::SeqCst);
                    }),
                    THRESHOLD,
                );
                let chunk = vec![0xa5u8; CHUNK];
                for _ in 0..CHUNKS {
                    conn.send(&chunk);
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

    // The client is not reading, so the server's writes back up.
    assert!(
        wait_until(Duration::from_secs(5), || hits.load(Ordering::SeqCst) == 1),
        "high-watermark callback did not fire"
    );
    let queued = reported.load(Ordering::SeqCst);
    assert!(
        queued >= THRESHOLD && queued <= 2 * THRESHOLD,
        "reported length {queued} outside [threshold, 2*threshold]"
    );

    // One crossing, one callback.
    thread::sleep(Duration::from_millis(300));
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    // Drain everything so the server can flush and tear down cleanly.
    let mut total = 0usize;
    let mut buffer = vec![0u8; 256 * 1024];
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    while total < CHUNK * CHUNKS {
        match client.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(err) => panic!("drain read failed: {err}"),
        }
    }
    assert_eq!(total, CHUNK * CHUNKS);

    drop(client);
    event_loop.quit();
    server_thread.join().unwrap();
}
