//! Level-triggered epoll backend.

use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{error, trace};

use super::Poller;
use crate::channel::Channel;

const INIT_EVENT_LIST_SIZE: usize = 16;

// Channel index values tracking kernel membership.
const INDEX_NEW: i32 = -1;
const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

pub(crate) struct EpollPoller {
    epoll_fd: OwnedFd,
    /// Output array for epoll_wait; doubled whenever a cycle fills it.
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd: unsafe { OwnedFd::from_raw_fd(fd) },
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, num_events: usize, active: &mut Vec<Arc<Channel>>) {
        debug_assert!(num_events <= self.events.len());
        for event in &self.events[..num_events] {
            let fd = event.u64 as RawFd;
            let Some(channel) = self.channels.get(&fd).and_then(Weak::upgrade) else {
                // The owner dropped the channel without deregistering; the
                // map entry is stale but harmless until it does.
                trace!("epoll event for unregistered fd {fd}");
                continue;
            };
            channel.set_revents(event.events);
            active.push(channel);
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = libc::epoll_event {
            events: channel.events(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!("epoll_ctl op=DEL fd={fd}: {err}");
            } else {
                panic!("epoll_ctl op={} fd={}: {}", op_to_string(op), fd, err);
            }
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        trace!("fd total count {}", self.channels.len());
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Instant::now();
        match n {
            n if n > 0 => {
                let n = n as usize;
                trace!("{n} events happened");
                self.fill_active_channels(n, active);
                if n == self.events.len() {
                    self.events
                        .resize(n * 2, libc::epoll_event { events: 0, u64: 0 });
                }
            }
            0 => trace!("nothing happened"),
            _ => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    error!("EpollPoller::poll: {err}");
                }
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        trace!("fd = {} events = {:#x} index = {}", fd, channel.events(), index);
        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                debug_assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, Arc::downgrade(channel));
            } else {
                debug_assert!(self.channels.contains_key(&fd));
            }
            channel.set_index(INDEX_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                // Suspended; leave it in the map for a later re-enable.
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("fd = {fd}");
        debug_assert!(channel.is_none_event());
        let index = channel.index();
        debug_assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);
        if index == INDEX_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        match self.channels.get(&channel.fd()) {
            Some(weak) => weak
                .upgrade()
                .is_some_and(|registered| std::ptr::eq(registered.as_ref(), channel)),
            None => false,
        }
    }
}

fn op_to_string(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_DEL => "DEL",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => "???",
    }
}
