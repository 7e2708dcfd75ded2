//! Connection balancing: with n I/O loops and k*n connections, round-robin
//! assignment gives every loop exactly k of them.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use whorl::{EventLoop, ServerOptions, TcpConnectionPtr, TcpServer};

const LOOPS: usize = 3;
const PER_LOOP: usize = 3;

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
fn connections_spread_round_robin_across_loops() {
    let assigned: Arc<Mutex<Vec<ThreadId>>> = Arc::new(Mutex::new(Vec::new()));
    let init_calls = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = mpsc::channel();
    let server_thread = {
        let assigned = assigned.clone();
        let init_calls = init_calls.clone();
        thread::spawn(move || {
            let event_loop = EventLoop::new().unwrap();
            let server = TcpServer::bind(
                &event_loop,
                "127.0.0.1:0".parse().unwrap(),
                "balance",
                ServerOptions::default(),
            )
            .unwrap();
            server.set_thread_num(LOOPS);
            server.set_thread_init_callback(Arc::new(move |_loop: &EventLoop| {
                init_calls.fetch_add(1, Ordering::SeqCst);
            }));
            server.set_connection_callback(Arc::new(move |conn: &TcpConnectionPtr| {
                if conn.connected() {
                    // Callbacks run on the loop the connection was assigned
                    // to, so the thread id identifies the loop.
                    assert!(conn.get_loop().is_in_loop_thread());
                    assigned.lock().unwrap().push(thread::current().id());
                }
            }));

            server.start();
            tx.send((event_loop.clone(), server.local_addr())).unwrap();
            event_loop.run();
            drop(server);
        })
    };

    let (event_loop, addr) = rx.recv().unwrap();
    assert_eq!(init_calls.load(Ordering::SeqCst), LOOPS);

    let mut clients = Vec::new();
    for _ in 0..LOOPS * PER_LOOP {
        clients.push(TcpStream::connect(addr).unwrap());
    }

    assert!(
        wait_until(Duration::from_secs(3), || {
            assigned.lock().unwrap().len() == LOOPS * PER_LOOP
        }),
        "not all connections were established"
    );

    let mut per_thread: HashMap<ThreadId, usize> = HashMap::new();
    for id in assigned.lock().unwrap().iter() {
        *per_thread.entry(*id).or_default() += 1;
    }
    assert_eq!(per_thread.len(), LOOPS, "expected {LOOPS} distinct loops");
    for (thread_id, count) in per_thread {
        assert_eq!(count, PER_LOOP, "loop thread {thread_id:?} got {count}");
    }

    drop(clients);
    event_loop.quit();
    server_thread.join().unwrap();
}
