use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::poller::Poller;

/// Poller over poll(2), kept for environments where epoll is undesirable;
/// selected with `MUXIO_USE_POLL`.
///
/// A parallel vector of pollfds mirrors the registered channels; each
/// channel's index field holds its slot. A channel that has suspended all
/// interest keeps its slot but stores `-fd - 1` as the descriptor so the
/// kernel ignores the entry without a structural removal.
pub struct PollPoller {
    pollfds: Vec<libc::pollfd>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl PollPoller {
    pub fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut Vec<Rc<Channel>>) {
        let mut left = num_events;
        for pfd in self.pollfds.iter() {
            if left == 0 {
                break;
            }
            if pfd.revents > 0 {
                left -= 1;
                let channel = self
                    .channels
                    .get(&pfd.fd)
                    .expect("poll reported a descriptor the poller does not know");
                assert_eq!(channel.fd(), pfd.fd);
                channel.set_revents(pfd.revents as u16 as u32);
                active_channels.push(Rc::clone(channel));
            }
        }
    }
}

impl Poller for PollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant {
        let res = syscall!(poll(
            self.pollfds.as_mut_ptr(),
            self.pollfds.len() as libc::nfds_t,
            timeout_ms,
        ));
        let now = Instant::now();

        match res {
            Ok(num_events) if num_events > 0 => {
                trace!("{} events happened", num_events);
                self.fill_active_channels(num_events as usize, active_channels);
            }
            Ok(_) => trace!("nothing happened"),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("PollPoller::poll(): {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let fd = channel.fd();
        trace!("fd = {} events = {{ {} }}", fd, channel.events_to_string());

        if channel.index() < 0 {
            // A new one, append to the vector. A channel arriving with no
            // interest starts out suspended.
            assert!(!self.channels.contains_key(&fd));
            let stored_fd = if channel.is_none_event() { -fd - 1 } else { fd };
            self.pollfds.push(libc::pollfd {
                fd: stored_fd,
                events: channel.events() as i16,
                revents: 0,
            });
            let index = (self.pollfds.len() - 1) as i32;
            channel.set_index(index);
            self.channels.insert(fd, Rc::clone(channel));
        } else {
            // Update the existing slot in place.
            assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| Rc::ptr_eq(known, channel)));
            let index = channel.index() as usize;
            assert!(index < self.pollfds.len());
            let pfd = &mut self.pollfds[index];
            assert!(pfd.fd == fd || pfd.fd == -fd - 1);
            pfd.fd = fd;
            pfd.events = channel.events() as i16;
            pfd.revents = 0;
            if channel.is_none_event() {
                // Ignore this slot without removing it.
                pfd.fd = -fd - 1;
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());

        let index = channel.index() as usize;
        assert!(index < self.pollfds.len());
        let pfd = &self.pollfds[index];
        assert!(pfd.fd == -fd - 1 && pfd.events == channel.events() as i16);
        self.channels.remove(&fd);
        channel.set_index(INDEX_NEW);

        // Swap with the last slot to keep the vector compact, re-patching
        // the moved channel's index.
        let last = self.pollfds.len() - 1;
        if index != last {
            let mut moved_fd = self.pollfds[last].fd;
            self.pollfds.swap(index, last);
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            self.channels
                .get(&moved_fd)
                .expect("moved pollfd has no channel")
                .set_index(index as i32);
        }
        self.pollfds.pop();
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| std::ptr::eq(Rc::as_ptr(known), channel))
    }

    fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.get(&fd).cloned()
    }
}

impl Default for PollPoller {
    fn default() -> PollPoller {
        PollPoller::new()
    }
}
