//! The reactor: at most one per thread.
//!
//! An `EventLoop` is a cheaply-cloneable handle; the state behind it belongs
//! to the thread that constructed it. Everything except `run_in_loop` /
//! `queue_in_loop` / `quit` / the timer API must be called on that thread,
//! and the loop aborts the offending call otherwise. Cross-thread callers
//! hand the loop a task; the task runs on the loop thread after the current
//! poll cycle's event dispatch.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};

use crate::channel::Channel;
use crate::error::Error;
use crate::poller::{self, Poller};
use crate::socket;
use crate::timer::{self, TimerCallback, TimerQueue};
use crate::TimerId;

/// Upper bound on one poll; wakeups and the timerfd cut it short.
const POLL_TIME_MS: i32 = 10_000;

pub(crate) type Task = Box<dyn FnOnce() + Send>;

thread_local! {
    static LOOP_IN_THIS_THREAD: RefCell<Weak<LoopInner>> = const { RefCell::new(Weak::new()) };
}

pub(crate) struct LoopInner {
    thread_id: ThreadId,
    thread_name: String,
    looping: AtomicBool,
    quit: AtomicBool,
    event_handling: AtomicBool,
    calling_pending_tasks: AtomicBool,
    iteration: AtomicU64,
    poll_return_time: Mutex<Instant>,
    poller: Mutex<Box<dyn Poller + Send>>,
    timers: Mutex<TimerQueue>,
    wakeup_fd: std::os::fd::OwnedFd,
    pending_tasks: Mutex<Vec<Task>>,
    context: Mutex<Option<Box<dyn Any + Send>>>,
    // The loop's own channels, kept alive here; their callbacks hold only
    // weak handles back to this struct.
    wakeup_channel: Mutex<Option<Arc<Channel>>>,
    timer_channel: Mutex<Option<Arc<Channel>>>,
}

/// Handle to one thread's reactor. `Clone` is cheap and the clone is the
/// usual way to give other threads something to post tasks through.
#[derive(Clone)]
pub struct EventLoop {
    inner: Arc<LoopInner>,
}

impl EventLoop {
    /// Create the event loop for the current thread. The poller backend is
    /// chosen by the `WHORL_USE_POLL` environment variable (default epoll).
    ///
    /// Panics if this thread already has an event loop.
    pub fn new() -> Result<EventLoop, Error> {
        Self::with_poller(poller::new_default_poller()?)
    }

    pub(crate) fn with_poller(poller: Box<dyn Poller + Send>) -> Result<EventLoop, Error> {
        let current = thread::current();
        LOOP_IN_THIS_THREAD.with(|cur| {
            if cur.borrow().upgrade().is_some() {
                panic!(
                    "another EventLoop already exists in thread {:?} ({})",
                    current.id(),
                    current.name().unwrap_or("unnamed"),
                );
            }
        });

        let timers = TimerQueue::new()?;
        let timer_fd = timers.timer_fd();
        let wakeup_fd = socket::new_event_fd()?;
        let wakeup_raw = wakeup_fd.as_raw_fd();

        let inner = Arc::new(LoopInner {
            thread_id: current.id(),
            thread_name: current.name().unwrap_or("unnamed").to_string(),
            looping: AtomicBool::new(false),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            calling_pending_tasks: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_time: Mutex::new(Instant::now()),
            poller: Mutex::new(poller),
            timers: Mutex::new(timers),
            wakeup_fd,
            pending_tasks: Mutex::new(Vec::new()),
            context: Mutex::new(None),
            wakeup_channel: Mutex::new(None),
            timer_channel: Mutex::new(None),
        });
        LOOP_IN_THIS_THREAD.with(|cur| *cur.borrow_mut() = Arc::downgrade(&inner));

        let event_loop = EventLoop {
            inner: inner.clone(),
        };

        let wakeup_channel = Channel::new(&event_loop, wakeup_raw);
        let weak = Arc::downgrade(&inner);
        wakeup_channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                EventLoop::from_inner(inner).handle_wakeup_read();
            }
        });
        wakeup_channel.enable_reading();
        *inner.wakeup_channel.lock().unwrap() = Some(wakeup_channel);

        let timer_channel = Channel::new(&event_loop, timer_fd);
        let weak = Arc::downgrade(&inner);
        timer_channel.set_read_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                EventLoop::from_inner(inner).handle_timer_expiry();
            }
        });
        timer_channel.enable_reading();
        *inner.timer_channel.lock().unwrap() = Some(timer_channel);

        debug!(
            "EventLoop created in thread {:?} ({})",
            inner.thread_id, inner.thread_name
        );
        Ok(event_loop)
    }

    pub(crate) fn from_inner(inner: Arc<LoopInner>) -> EventLoop {
        EventLoop { inner }
    }

    pub(crate) fn downgrade_inner(&self) -> Weak<LoopInner> {
        Arc::downgrade(&self.inner)
    }

    /// The event loop of the calling thread, if one was constructed there.
    pub fn current() -> Option<EventLoop> {
        LOOP_IN_THIS_THREAD
            .with(|cur| cur.borrow().upgrade())
            .map(EventLoop::from_inner)
    }

    /// Drive the reactor until `quit()`. Must be called on the owning thread;
    /// at most one `run` may be active at a time.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(
            !self.inner.looping.swap(true, Ordering::SeqCst),
            "this EventLoop is already running"
        );
        self.inner.quit.store(false, Ordering::SeqCst);
        trace!("EventLoop start looping");

        let mut active: Vec<Arc<Channel>> = Vec::new();
        while !self.inner.quit.load(Ordering::SeqCst) {
            active.clear();
            let poll_time = self
                .inner
                .poller
                .lock()
                .unwrap()
                .poll(POLL_TIME_MS, &mut active);
            *self.inner.poll_return_time.lock().unwrap() = poll_time;
            self.inner.iteration.fetch_add(1, Ordering::Relaxed);

            self.inner.event_handling.store(true, Ordering::Relaxed);
            for channel in &active {
                trace!("{{{}}}", channel.events_to_string());
                channel.handle_event(poll_time);
            }
            self.inner.event_handling.store(false, Ordering::Relaxed);

            self.run_pending_tasks();
        }

        trace!("EventLoop stop looping");
        self.inner.looping.store(false, Ordering::SeqCst);
    }

    /// Stop the loop after the current iteration. Callable from any thread;
    /// observable before the poll timeout elapses.
    pub fn quit(&self) {
        self.inner.quit.store(true, Ordering::SeqCst);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Run `task` on the loop thread: inline when already there, queued (and
    /// the loop woken) otherwise.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queue `task` for the loop thread. It runs after the current poll
    /// cycle's event dispatch and before the next poll.
    pub fn queue_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.inner.pending_tasks.lock().unwrap().push(Box::new(task));

        // During event dispatch on the loop thread the queue is drained
        // before the next poll anyway; everyone else must wake the loop.
        if !self.is_in_loop_thread() || self.inner.calling_pending_tasks.load(Ordering::SeqCst) {
            self.wakeup();
        }
    }

    pub fn queue_size(&self) -> usize {
        self.inner.pending_tasks.lock().unwrap().len()
    }

    /// Run `callback` at `when`. Callable from any thread.
    pub fn run_at(&self, when: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(when, Duration::ZERO, Box::new(callback))
    }

    /// Run `callback` once, `delay` from now. Callable from any thread.
    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Run `callback` every `interval`, first in one interval from now.
    /// Callable from any thread.
    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        assert!(!interval.is_zero());
        self.add_timer(Instant::now() + interval, interval, Box::new(callback))
    }

    /// Cancel a timer. A timer already selected for dispatch is honoured too:
    /// a repeating timer cancelled from inside its own callback does not
    /// reschedule. Callable from any thread.
    pub fn cancel(&self, timer_id: TimerId) {
        let this = self.clone();
        self.run_in_loop(move || {
            this.inner.timers.lock().unwrap().cancel(timer_id);
        });
    }

    fn add_timer(&self, when: Instant, interval: Duration, callback: TimerCallback) -> TimerId {
        let id = timer::next_timer_id();
        let this = self.clone();
        self.run_in_loop(move || {
            this.inner
                .timers
                .lock()
                .unwrap()
                .add_timer(id, when, interval, callback);
        });
        id
    }

    /// Time of the most recent poll return, usually meaning data arrival.
    pub fn poll_return_time(&self) -> Instant {
        *self.inner.poll_return_time.lock().unwrap()
    }

    pub fn iteration(&self) -> u64 {
        self.inner.iteration.load(Ordering::Relaxed)
    }

    pub fn event_handling(&self) -> bool {
        self.inner.event_handling.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.thread_id
    }

    /// Hard-stop on thread-affinity violations; this is a correctness
    /// invariant, not a recoverable condition.
    #[inline]
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            self.abort_not_in_loop_thread();
        }
    }

    /// Stash an arbitrary value on the loop for callbacks to share.
    pub fn set_context<T: Any + Send>(&self, value: T) {
        *self.inner.context.lock().unwrap() = Some(Box::new(value));
    }

    /// Borrow the context stashed with `set_context`, if it has type `T`.
    pub fn with_context<T: Any + Send, R>(&self, f: impl FnOnce(Option<&mut T>) -> R) -> R {
        let mut guard = self.inner.context.lock().unwrap();
        f(guard.as_mut().and_then(|ctx| ctx.downcast_mut::<T>()))
    }

    /// Write one byte-count to the eventfd so a sleeping poll returns.
    pub(crate) fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.inner.wakeup_fd.as_raw_fd(),
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("EventLoop::wakeup writes {n} bytes instead of 8");
        }
    }

    pub(crate) fn update_channel(&self, channel: &Arc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Channel) {
        self.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().remove_channel(channel);
    }

    #[allow(dead_code)]
    pub(crate) fn has_channel(&self, channel: &Channel) -> bool {
        self.assert_in_loop_thread();
        self.inner.poller.lock().unwrap().has_channel(channel)
    }

    fn handle_wakeup_read(&self) {
        let mut count: u64 = 0;
        let n = unsafe {
            libc::read(
                self.inner.wakeup_fd.as_raw_fd(),
                &mut count as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            error!("EventLoop::handle_wakeup_read reads {n} bytes instead of 8");
        }
    }

    fn handle_timer_expiry(&self) {
        self.assert_in_loop_thread();
        let now = Instant::now();
        let mut expired = self.inner.timers.lock().unwrap().take_expired(now);
        // No queue lock across callbacks: they may add or cancel timers.
        for (_, entry) in expired.iter_mut() {
            (entry.callback)();
        }
        self.inner.timers.lock().unwrap().restart_expired(expired, now);
    }

    fn run_pending_tasks(&self) {
        self.inner.calling_pending_tasks.store(true, Ordering::SeqCst);
        // Swap under the lock, run outside it. Tasks queued while we run
        // these wait for the next iteration.
        let tasks = mem::take(&mut *self.inner.pending_tasks.lock().unwrap());
        for task in tasks {
            task();
        }
        self.inner.calling_pending_tasks.store(false, Ordering::SeqCst);
    }

    #[cold]
    fn abort_not_in_loop_thread(&self) -> ! {
        error!(
            "EventLoop owned by thread {:?} ({}) was used from thread {:?} ({})",
            self.inner.thread_id,
            self.inner.thread_name,
            thread::current().id(),
            thread::current().name().unwrap_or("unnamed"),
        );
        panic!(
            "EventLoop::assert_in_loop_thread - loop owned by {:?}, called from {:?}",
            self.inner.thread_id,
            thread::current().id(),
        );
    }
}
