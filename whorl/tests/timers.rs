//! Timer behaviour through the public API, driven from a foreign thread.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use whorl::EventLoop;

fn start_loop() -> (EventLoop, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let event_loop = EventLoop::new().unwrap();
        tx.send(event_loop.clone()).unwrap();
        event_loop.run();
    });
    (rx.recv().unwrap(), handle)
}

#[test]
fn repeating_timer_ticks_then_stops_on_cancel() {
    let (event_loop, handle) = start_loop();
    let ticks = Arc::new(AtomicUsize::new(0));

    let counter = ticks.clone();
    let id = event_loop.run_every(Duration::from_millis(50), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    thread::sleep(Duration::from_secs(1));
    event_loop.cancel(id);
    // Give a possibly in-flight tick a moment to land before sampling.
    thread::sleep(Duration::from_millis(100));
    let after_cancel = ticks.load(Ordering::SeqCst);

    assert!(
        (15..=25).contains(&after_cancel),
        "expected ~20 ticks in one second, got {after_cancel}"
    );

    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        ticks.load(Ordering::SeqCst),
        after_cancel,
        "timer fired after cancel"
    );

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn timer_cancelled_before_deadline_never_fires() {
    let (event_loop, handle) = start_loop();
    let fired = Arc::new(AtomicUsize::new(0));

    let counter = fired.clone();
    let id = event_loop.run_after(Duration::from_millis(200), move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    event_loop.cancel(id);

    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    event_loop.quit();
    handle.join().unwrap();
}

#[test]
fn one_shot_timers_fire_in_deadline_order() {
    let (event_loop, handle) = start_loop();
    let order = Arc::new(std::sync::Mutex::new(Vec::new()));

    for (label, delay_ms) in [("c", 90u64), ("a", 30), ("b", 60)] {
        let order = order.clone();
        event_loop.run_after(Duration::from_millis(delay_ms), move || {
            order.lock().unwrap().push(label);
        });
    }

    thread::sleep(Duration::from_millis(300));
    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);

    event_loop.quit();
    handle.join().unwrap();
}
