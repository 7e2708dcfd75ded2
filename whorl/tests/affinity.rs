//! Thread-affinity contract through the public API: loop-thread-only methods
//! abort off-thread and succeed on-thread, and a thread holds at most one
//! event loop.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::thread;

use whorl::EventLoop;

#[test]
fn run_from_foreign_thread_aborts() {
    let (tx, rx) = mpsc::channel();
    let (quit_tx, quit_rx) = mpsc::channel::<()>();
    let owner = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.clone()).unwrap();
        // Keep the loop alive until the other thread is done poking it.
        quit_rx.recv().unwrap();
        drop(event_loop);
    });
    let event_loop = rx.recv().unwrap();

    assert!(!event_loop.is_in_loop_thread());
    let panicked = catch_unwind(AssertUnwindSafe(|| event_loop.run())).is_err();
    assert!(panicked, "run() off the owning thread must abort");

    quit_tx.send(()).unwrap();
    owner.join().unwrap();
}

#[test]
fn owning_thread_passes_the_affinity_check() {
    let event_loop = EventLoop::new().unwrap();
    assert!(event_loop.is_in_loop_thread());
    event_loop.assert_in_loop_thread();
}

#[test]
fn one_event_loop_per_thread() {
    let second_failed = thread::spawn(|| {
        let _first = EventLoop::new().unwrap();
        catch_unwind(AssertUnwindSafe(EventLoop::new)).is_err()
    })
    .join()
    .unwrap();
    assert!(second_failed);
}
