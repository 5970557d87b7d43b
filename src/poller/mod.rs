//! Readiness pollers.
//!
//! A poller owns one OS readiness object and a descriptor-to-channel map;
//! given the registered interest sets it returns the channels that are
//! ready within a timeout. Both variants are level-triggered and report
//! ready channels in the kernel's order. All methods are called only on
//! the owning loop's thread.

use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use crate::channel::Channel;

mod epoll;
mod poll;

pub use epoll::EpollPoller;
pub use poll::PollPoller;

pub trait Poller {
    /// Waits up to `timeout_ms` for readiness, appends the ready channels
    /// (with their ready masks filled in) to `active_channels` and returns
    /// the poll-return timestamp.
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant;

    /// Synchronises the channel's interest mask with the kernel,
    /// registering the channel first if the poller has not seen it.
    fn update_channel(&mut self, channel: &Rc<Channel>);

    /// Drops the channel from the poller. The interest mask must already
    /// be empty.
    fn remove_channel(&mut self, channel: &Channel);

    fn has_channel(&self, channel: &Channel) -> bool;

    /// The registered channel observing `fd`, if any.
    fn channel(&self, fd: RawFd) -> Option<Rc<Channel>>;
}

/// Selects the poller variant: poll(2) when `MUXIO_USE_POLL` is set in the
/// environment, epoll otherwise.
pub(crate) fn new_default_poller() -> std::io::Result<Box<dyn Poller>> {
    if std::env::var_os("MUXIO_USE_POLL").is_some() {
        Ok(Box::new(PollPoller::new()))
    } else {
        EpollPoller::new().map(|p| Box::new(p) as Box<dyn Poller>)
    }
}
