//! Timer queue backed by a monotonic timerfd.
//!
//! Live timers sit in an ordered map keyed by `(deadline, id)`; the id breaks
//! ties so timers with equal deadlines fire in creation order. The timerfd is
//! armed to the earliest deadline only; when it fires, every expired timer is
//! drained in one pass before any callback runs, so callbacks that add or
//! cancel timers never observe stale kernel state.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{error, trace};

use crate::socket;

/// Identifies one timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

static NUM_CREATED: AtomicU64 = AtomicU64::new(0);

pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

pub(crate) struct TimerEntry {
    pub(crate) id: u64,
    pub(crate) callback: TimerCallback,
    /// Zero for one-shot timers.
    pub(crate) interval: Duration,
}

pub(crate) fn next_timer_id() -> TimerId {
    TimerId(NUM_CREATED.fetch_add(1, Ordering::Relaxed) + 1)
}

pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    timers: BTreeMap<(Instant, u64), TimerEntry>,
    /// id -> current deadline, for cancellation lookups.
    active: HashMap<u64, Instant>,
    /// ids cancelled while their callback run is in flight; checked before a
    /// repeating timer is rescheduled.
    cancelling: HashSet<u64>,
    calling_expired: bool,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            timer_fd: socket::new_timer_fd()?,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            cancelling: HashSet::new(),
            calling_expired: false,
        })
    }

    pub(crate) fn timer_fd(&self) -> RawFd {
        self.timer_fd.as_raw_fd()
    }

    /// Insert a timer; re-arms the timerfd when the new timer becomes the
    /// earliest deadline.
    pub(crate) fn add_timer(
        &mut self,
        id: TimerId,
        when: Instant,
        interval: Duration,
        callback: TimerCallback,
    ) {
        let earliest_changed = self
            .timers
            .first_key_value()
            .map(|(first, _)| (when, id.0) < *first)
            .unwrap_or(true);

        self.timers.insert(
            (when, id.0),
            TimerEntry {
                id: id.0,
                callback,
                interval,
            },
        );
        self.active.insert(id.0, when);

        if earliest_changed {
            self.arm(when);
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.active.remove(&id.0) {
            let removed = self.timers.remove(&(when, id.0));
            debug_assert!(removed.is_some());
        } else if self.calling_expired {
            // Already pulled out for dispatch; make sure it does not
            // reschedule.
            self.cancelling.insert(id.0);
        }
        trace!("cancel timer {}", id.0);
    }

    /// Pull every timer with `deadline <= now` out of the queue, in deadline
    /// order. Callbacks are invoked by the caller with no queue lock held.
    pub(crate) fn take_expired(&mut self, now: Instant) -> Vec<(Instant, TimerEntry)> {
        self.read_timer_fd();

        let sentinel = (now, u64::MAX);
        let remaining = self.timers.split_off(&sentinel);
        let expired = mem::replace(&mut self.timers, remaining);

        let expired: Vec<(Instant, TimerEntry)> = expired
            .into_iter()
            .map(|((when, _), entry)| (when, entry))
            .collect();
        for (_, entry) in &expired {
            self.active.remove(&entry.id);
        }

        self.calling_expired = true;
        self.cancelling.clear();
        expired
    }

    /// Reschedule repeating timers that were not cancelled during dispatch
    /// and re-arm the timerfd once for the next deadline.
    pub(crate) fn restart_expired(&mut self, expired: Vec<(Instant, TimerEntry)>, now: Instant) {
        for (when, entry) in expired {
            if !entry.interval.is_zero() && !self.cancelling.contains(&entry.id) {
                // Advance from the previous deadline to keep the cadence
                // drift-free; skip ticks missed while the loop was stalled.
                let mut next = when + entry.interval;
                if next <= now {
                    next = now + entry.interval;
                }
                self.active.insert(entry.id, next);
                self.timers.insert((next, entry.id), entry);
            }
        }
        self.calling_expired = false;

        if let Some(((next, _), _)) = self.timers.first_key_value() {
            self.arm(*next);
        }
    }

    fn arm(&self, when: Instant) {
        // At least 100us out, so an already-due deadline still arms instead
        // of disarming the fd.
        let delay = when
            .saturating_duration_since(Instant::now())
            .max(Duration::from_micros(100));
        let new_value = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: delay.as_secs() as libc::time_t,
                tv_nsec: delay.subsec_nanos() as libc::c_long,
            },
        };
        let ret = unsafe {
            libc::timerfd_settime(
                self.timer_fd.as_raw_fd(),
                0,
                &new_value,
                std::ptr::null_mut(),
            )
        };
        if ret != 0 {
            error!("timerfd_settime: {}", io::Error::last_os_error());
        }
    }

    /// Clear the fd's readiness by reading the expiration count.
    fn read_timer_fd(&self) {
        let mut howmany: u64 = 0;
        let n = unsafe {
            libc::read(
                self.timer_fd.as_raw_fd(),
                &mut howmany as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        trace!("TimerQueue::read_timer_fd {howmany}");
        if n != 8 {
            // Also reached on a spurious wakeup before the fd fired.
            trace!("read_timer_fd reads {n} bytes instead of 8");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    fn counting_callback(counter: &Arc<AtomicUsize>) -> TimerCallback {
        let counter = counter.clone();
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn ids_are_unique_and_increasing() {
        let a = next_timer_id();
        let b = next_timer_id();
        assert!(b.0 > a.0);
    }

    #[test]
    fn expired_timers_drain_in_deadline_order() {
        let mut queue = TimerQueue::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let late = next_timer_id();
        let early = next_timer_id();
        queue.add_timer(
            late,
            now + Duration::from_millis(5),
            Duration::ZERO,
            counting_callback(&counter),
        );
        queue.add_timer(
            early,
            now + Duration::from_millis(1),
            Duration::ZERO,
            counting_callback(&counter),
        );
        let future = next_timer_id();
        queue.add_timer(
            future,
            now + Duration::from_secs(60),
            Duration::ZERO,
            counting_callback(&counter),
        );

        let expired = queue.take_expired(now + Duration::from_millis(10));
        assert_eq!(expired.len(), 2);
        assert!(expired[0].0 < expired[1].0);
        queue.restart_expired(expired, now + Duration::from_millis(10));

        // The far-future timer is still queued.
        assert_eq!(queue.timers.len(), 1);
        assert!(queue.active.contains_key(&future.0));
    }

    #[test]
    fn cancel_before_deadline_removes_timer() {
        let mut queue = TimerQueue::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let id = next_timer_id();
        queue.add_timer(
            id,
            now + Duration::from_millis(1),
            Duration::ZERO,
            counting_callback(&counter),
        );
        queue.cancel(id);

        let expired = queue.take_expired(now + Duration::from_millis(10));
        assert!(expired.is_empty());
        assert!(queue.timers.is_empty());
    }

    #[test]
    fn repeating_timer_reschedules_unless_cancelled_mid_dispatch() {
        let mut queue = TimerQueue::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let now = Instant::now();

        let repeating = next_timer_id();
        queue.add_timer(
            repeating,
            now,
            Duration::from_millis(50),
            counting_callback(&counter),
        );

        let expired = queue.take_expired(now + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        queue.restart_expired(expired, now + Duration::from_millis(1));
        assert_eq!(queue.timers.len(), 1, "repeating timer rescheduled");

        // Second round: cancel while the entry is out for dispatch.
        let expired = queue.take_expired(now + Duration::from_millis(100));
        assert_eq!(expired.len(), 1);
        queue.cancel(repeating);
        queue.restart_expired(expired, now + Duration::from_millis(100));
        assert!(queue.timers.is_empty(), "cancelled mid-dispatch, not rescheduled");
    }
}
