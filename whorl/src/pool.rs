//! I/O loop threads and the round-robin pool handing connections to them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use tracing::{debug, error};

use crate::error::Error;
use crate::event_loop::EventLoop;

/// Per-worker initialization hook, run on the worker thread before its loop
/// starts.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// One worker thread owning one event loop.
pub(crate) struct EventLoopThread {
    event_loop: EventLoop,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn the worker and block until its loop is observed live.
    pub(crate) fn start(
        name: String,
        init: Option<ThreadInitCallback>,
    ) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = match EventLoop::new() {
                    Ok(event_loop) => event_loop,
                    Err(err) => {
                        error!("EventLoop creation in worker failed: {err}");
                        return;
                    }
                };
                if let Some(init) = init {
                    (*init)(&event_loop);
                }
                // The sender drops either way; a dropped channel tells the
                // spawner the worker is dead.
                tx.send(event_loop.clone()).ok();
                event_loop.run();
            })
            .map_err(Error::Io)?;

        let event_loop = rx
            .recv()
            .map_err(|_| Error::WorkerStartup(format!("worker {name} exited during startup")))?;

        Ok(EventLoopThread {
            event_loop,
            thread: Some(thread),
        })
    }

    pub(crate) fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.event_loop.quit();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("event loop worker panicked");
            }
        }
    }
}

/// Pool of I/O loops fed by one base loop (the acceptor's).
///
/// With zero threads every connection shares the base loop; otherwise
/// connections are assigned round-robin across the workers, which keeps
/// assignment fair and deterministic.
pub struct EventLoopThreadPool {
    base_loop: EventLoop,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    workers: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<EventLoop>>,
}

impl EventLoopThreadPool {
    pub fn new(base_loop: &EventLoop, name: impl Into<String>) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base_loop: base_loop.clone(),
            name: name.into(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            workers: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn set_thread_num(&self, num_threads: usize) {
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spawn the workers. Runs on the base loop's thread; returns once every
    /// worker loop is live.
    pub fn start(&self, init: Option<ThreadInitCallback>) -> Result<(), Error> {
        self.base_loop.assert_in_loop_thread();
        assert!(!self.started.swap(true, Ordering::AcqRel), "pool already started");

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        let mut workers = self.workers.lock().unwrap();
        let mut loops = self.loops.lock().unwrap();
        for i in 0..num_threads {
            let worker = EventLoopThread::start(format!("{}-loop-{i}", self.name), init.clone())?;
            loops.push(worker.event_loop().clone());
            workers.push(worker);
        }
        debug!("{}: {} worker loops started", self.name, num_threads);

        if num_threads == 0 {
            if let Some(init) = init {
                (*init)(&self.base_loop);
            }
        }
        Ok(())
    }

    /// Next loop in round-robin order; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> EventLoop {
        self.base_loop.assert_in_loop_thread();
        debug_assert!(self.started());
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base_loop.clone()
        } else {
            let index = self.next.fetch_add(1, Ordering::Relaxed) % loops.len();
            loops[index].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<EventLoop> {
        self.base_loop.assert_in_loop_thread();
        debug_assert!(self.started());
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base_loop.clone()]
        } else {
            loops.clone()
        }
    }
}
