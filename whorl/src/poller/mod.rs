//! Readiness multiplexing backends behind one interface.
//!
//! Both backends are level-triggered. The epoll backend is the default; the
//! `WHORL_USE_POLL` environment variable selects the poll(2) backend instead,
//! which exists for portability across older kernels and as a reference
//! implementation.

mod epoll;
mod poll;

use std::io;
use std::sync::Arc;
use std::time::Instant;

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

use crate::channel::Channel;

/// Environment variable that selects the poll(2) backend.
pub const USE_POLL_ENV: &str = "WHORL_USE_POLL";

pub(crate) trait Poller: Send {
    /// Block for up to `timeout_ms` waiting for readiness, filling `active`
    /// with the channels that have events pending and stamping each channel's
    /// revents. Returns the wake time. A timeout leaves `active` empty;
    /// spurious wakeups with zero events are legal.
    fn poll(&mut self, timeout_ms: i32, active: &mut Vec<Arc<Channel>>) -> Instant;

    /// Add the channel or reconcile its kernel interest with `events()`.
    /// An empty interest set removes the fd from the kernel set but keeps the
    /// channel in the map, for connections that temporarily suspend reading.
    fn update_channel(&mut self, channel: &Arc<Channel>);

    /// Remove the channel from both the map and the kernel set. The channel's
    /// interest must already be empty.
    fn remove_channel(&mut self, channel: &Channel);

    /// Whether the channel is currently registered with this poller.
    fn has_channel(&self, channel: &Channel) -> bool;
}

/// Construct the backend selected by the environment.
pub(crate) fn new_default_poller() -> io::Result<Box<dyn Poller + Send>> {
    if std::env::var_os(USE_POLL_ENV).is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        Ok(Box::new(EpollPoller::new()?))
    }
}
