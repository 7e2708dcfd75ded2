//! Per-fd event registration and dispatch.
//!
//! A `Channel` binds one file descriptor to its interest mask, the readiness
//! snapshot the poller filled in, and the callbacks for each event class. It
//! never owns the fd; the object owning the fd (connection, acceptor, the
//! loop's own wakeup and timer fds) owns the channel and must `disable_all` +
//! `remove` it before dropping it.

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{trace, warn};

use crate::event_loop::{EventLoop, LoopInner};

pub(crate) const NONE_EVENT: u32 = 0;
pub(crate) const READ_EVENT: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const WRITE_EVENT: u32 = libc::POLLOUT as u32;

const POLLIN: u32 = libc::POLLIN as u32;
const POLLPRI: u32 = libc::POLLPRI as u32;
const POLLOUT: u32 = libc::POLLOUT as u32;
const POLLHUP: u32 = libc::POLLHUP as u32;
const POLLERR: u32 = libc::POLLERR as u32;
const POLLNVAL: u32 = libc::POLLNVAL as u32;
const POLLRDHUP: u32 = libc::POLLRDHUP as u32;

pub(crate) type ReadEventCallback = Box<dyn FnMut(Instant) + Send>;
pub(crate) type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Callbacks {
    read: Option<ReadEventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
    /// Weak handle to the owner; dispatch is suppressed once it is gone.
    tie: Option<Weak<dyn Any + Send + Sync>>,
}

pub(crate) struct Channel {
    fd: RawFd,
    owner: Weak<LoopInner>,
    self_weak: Weak<Channel>,
    /// Interest mask, poll(2) bit values (numerically equal to epoll's).
    events: AtomicU32,
    /// Readiness snapshot, written by the poller before dispatch.
    revents: AtomicU32,
    /// Poller bookkeeping: slot index for poll(2), membership state for epoll.
    index: AtomicI32,
    tied: AtomicBool,
    event_handling: AtomicBool,
    added_to_loop: AtomicBool,
    callbacks: Mutex<Callbacks>,
}

impl Channel {
    pub(crate) fn new(event_loop: &EventLoop, fd: RawFd) -> Arc<Channel> {
        Arc::new_cyclic(|self_weak| Channel {
            fd,
            owner: event_loop.downgrade_inner(),
            self_weak: self_weak.clone(),
            events: AtomicU32::new(NONE_EVENT),
            revents: AtomicU32::new(NONE_EVENT),
            index: AtomicI32::new(-1),
            tied: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            added_to_loop: AtomicBool::new(false),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn events(&self) -> u32 {
        self.events.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.store(revents, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn index(&self) -> i32 {
        self.index.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_index(&self, index: i32) {
        self.index.store(index, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn is_none_event(&self) -> bool {
        self.events() == NONE_EVENT
    }

    #[inline]
    pub(crate) fn is_reading(&self) -> bool {
        self.events() & READ_EVENT != 0
    }

    #[inline]
    pub(crate) fn is_writing(&self) -> bool {
        self.events() & WRITE_EVENT != 0
    }

    pub(crate) fn set_read_callback(&self, cb: impl FnMut(Instant) + Send + 'static) {
        self.callbacks.lock().unwrap().read = Some(Box::new(cb));
    }

    pub(crate) fn set_write_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().write = Some(Box::new(cb));
    }

    pub(crate) fn set_close_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().close = Some(Box::new(cb));
    }

    pub(crate) fn set_error_callback(&self, cb: impl FnMut() + Send + 'static) {
        self.callbacks.lock().unwrap().error = Some(Box::new(cb));
    }

    /// Tie this channel to its owner. Dispatch promotes the weak handle to a
    /// strong one for the duration of the callbacks, and is skipped entirely
    /// once the owner has died.
    pub(crate) fn tie<T: Any + Send + Sync>(&self, owner: &Arc<T>) {
        let owner: Arc<dyn Any + Send + Sync> = owner.clone();
        let weak: Weak<dyn Any + Send + Sync> = Arc::downgrade(&owner);
        self.callbacks.lock().unwrap().tie = Some(weak);
        self.tied.store(true, Ordering::Release);
    }

    pub(crate) fn enable_reading(&self) {
        self.events.fetch_or(READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_reading(&self) {
        self.events.fetch_and(!READ_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn enable_writing(&self) {
        self.events.fetch_or(WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_writing(&self) {
        self.events.fetch_and(!WRITE_EVENT, Ordering::Relaxed);
        self.update();
    }

    pub(crate) fn disable_all(&self) {
        self.events.store(NONE_EVENT, Ordering::Relaxed);
        self.update();
    }

    /// Deregister from the poller. Interest must already be empty and no
    /// further method may be called afterwards.
    pub(crate) fn remove(&self) {
        assert!(self.is_none_event());
        if !self.added_to_loop.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(inner) = self.owner.upgrade() {
            EventLoop::from_inner(inner).remove_channel(self);
        }
    }

    fn update(&self) {
        let Some(this) = self.self_weak.upgrade() else {
            return;
        };
        match self.owner.upgrade() {
            Some(inner) => {
                self.added_to_loop.store(true, Ordering::Relaxed);
                EventLoop::from_inner(inner).update_channel(&this);
            }
            None => warn!("channel fd {} updated after its loop died", self.fd),
        }
    }

    /// Dispatch the readiness snapshot to the registered callbacks, one pass:
    /// error, read, write, then close (hang-up with nothing left to read).
    pub(crate) fn handle_event(&self, receive_time: Instant) {
        let mut callbacks = self.callbacks.lock().unwrap();

        // Keep the owner alive across the callbacks; skip dispatch if it is
        // already gone.
        let _guard: Option<Arc<dyn Any + Send + Sync>>;
        if self.tied.load(Ordering::Acquire) {
            match callbacks.tie.as_ref().and_then(Weak::upgrade) {
                Some(owner) => _guard = Some(owner),
                None => {
                    trace!("channel fd {} owner is gone, dropping events", self.fd);
                    return;
                }
            }
        } else {
            _guard = None;
        }

        self.event_handling.store(true, Ordering::Relaxed);
        let revents = self.revents.load(Ordering::Relaxed);

        if revents & (POLLERR | POLLNVAL) != 0 {
            if revents & POLLNVAL != 0 {
                warn!("channel fd {} got POLLNVAL", self.fd);
            }
            if let Some(cb) = callbacks.error.as_mut() {
                cb();
            }
        }
        if revents & (POLLIN | POLLPRI | POLLRDHUP) != 0 {
            if let Some(cb) = callbacks.read.as_mut() {
                cb(receive_time);
            }
        }
        if revents & POLLOUT != 0 {
            if let Some(cb) = callbacks.write.as_mut() {
                cb();
            }
        }
        if revents & POLLHUP != 0 && revents & POLLIN == 0 {
            if let Some(cb) = callbacks.close.as_mut() {
                cb();
            }
        }

        self.event_handling.store(false, Ordering::Relaxed);
    }

    pub(crate) fn events_to_string(&self) -> String {
        let revents = self.revents.load(Ordering::Relaxed);
        let mut out = format!("{}: ", self.fd);
        for (bit, name) in [
            (POLLIN, "IN "),
            (POLLPRI, "PRI "),
            (POLLOUT, "OUT "),
            (POLLHUP, "HUP "),
            (POLLRDHUP, "RDHUP "),
            (POLLERR, "ERR "),
            (POLLNVAL, "NVAL "),
        ] {
            if revents & bit != 0 {
                out.push_str(name);
            }
        }
        out
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.load(Ordering::Relaxed));
    }
}
