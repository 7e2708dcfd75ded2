//! Level-triggered poll(2) backend over a readiness array.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tracing::{error, trace};

use super::Poller;
use crate::channel::Channel;

pub(crate) struct PollPoller {
    /// One slot per registered channel; a channel's index is its slot.
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Weak<Channel>>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, mut num_events: usize, active: &mut Vec<Arc<Channel>>) {
        for pfd in &self.pollfds {
            if num_events == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            num_events -= 1;
            let Some(channel) = self.channels.get(&pfd.fd).and_then(Weak::upgrade) else {
                trace!("poll event for unregistered fd {}", pfd.fd);
                continue;
            };
            debug_assert_eq!(channel.fd(), pfd.fd);
            channel.set_revents(pfd.revents as u32);
            active.push(channel);
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Instant::now();
        match n {
            n if n > 0 => {
                trace!("{n} events happened");
                self.fill_active_channels(n as usize, active);
            }
            0 => trace!("nothing happened"),
            _ => {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    error!("PollPoller::poll: {err}");
                }
            }
        }
        now
    }

    fn update_channel(&mut self, channel: &Arc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {} events = {:#x}", fd, channel.events());
        if channel.index() < 0 {
            // New registration.
            debug_assert!(!self.channels.contains_key(&fd));
            self.pollfds.push(libc::pollfd {
                fd,
                events: channel.events() as libc::c_short,
                revents: 0,
            });
            channel.set_index(self.pollfds.len() as i32 - 1);
            self.channels.insert(fd, Arc::downgrade(channel));
        } else {
            let index = channel.index() as usize;
            debug_assert!(self.channels.contains_key(&fd));
            debug_assert!(index < self.pollfds.len());
            let pfd = &mut self.pollfds[index];
            debug_assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = channel.events() as libc::c_short;
            pfd.revents = 0;
            if channel.is_none_event() {
                // A negative fd makes poll(2) skip the slot; the channel
                // stays registered for a later re-enable.
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("fd = {fd}");
        debug_assert!(channel.is_none_event());
        let index = channel.index() as usize;
        debug_assert!(index < self.pollfds.len());
        self.channels.remove(&fd);
        self.pollfds.swap_remove(index);
        if index < self.pollfds.len() {
            // Patch the channel that got moved into the vacated slot.
            let mut moved_fd = self.pollfds[index].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(moved) = self.channels.get(&moved_fd).and_then(Weak::upgrade) {
                moved.set_index(index as i32);
            }
        }
        channel.set_index(-1);
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
