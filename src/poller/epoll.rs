use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Instant;

use log::{error, trace};

use crate::channel::{Channel, INDEX_NEW};
use crate::poller::Poller;

// Registration tags stored in the channel. `INDEX_ADDED` means the
// descriptor is in the kernel set and the map; `INDEX_DELETED` means it
// was taken out of the kernel set (all interest cleared) but is still in
// the map and can be re-added cheaply.
const INDEX_ADDED: i32 = 1;
const INDEX_DELETED: i32 = 2;

const INIT_EVENT_LIST_SIZE: usize = 16;

/// Level-triggered poller over epoll(4).
pub struct EpollPoller {
    epoll_fd: OwnedFd,
    events: Vec<libc::epoll_event>,
    channels: HashMap<RawFd, Rc<Channel>>,
}

impl EpollPoller {
    pub fn new() -> io::Result<EpollPoller> {
        // SAFETY: `epoll_create1(2)` ensures the fd is valid.
        let epoll_fd =
            unsafe { OwnedFd::from_raw_fd(syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?) };
        Ok(EpollPoller {
            epoll_fd,
            events: vec![new_event(0, 0); INIT_EVENT_LIST_SIZE],
            channels: HashMap::new(),
        })
    }

    fn fill_active_channels(&self, num_events: usize, active_channels: &mut Vec<Rc<Channel>>) {
        assert!(num_events <= self.events.len());
        for event in &self.events[..num_events] {
            let fd = event.u64 as RawFd;
            let channel = self
                .channels
                .get(&fd)
                .expect("epoll reported a descriptor the poller does not know");
            channel.set_revents(event.events);
            active_channels.push(Rc::clone(channel));
        }
    }

    fn update(&self, op: libc::c_int, channel: &Channel) {
        let fd = channel.fd();
        let mut event = new_event(channel.events(), fd);
        trace!(
            "epoll_ctl op = {} fd = {} event = {{ {} }}",
            op_to_string(op),
            fd,
            channel.events_to_string()
        );
        if let Err(err) = syscall!(epoll_ctl(self.epoll_fd.as_raw_fd(), op, fd, &mut event)) {
            error!("epoll_ctl op = {} fd = {}: {}", op_to_string(op), fd, err);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(&mut self, timeout_ms: i32, active_channels: &mut Vec<Rc<Channel>>) -> Instant {
        trace!("fd total count {}", self.channels.len());
        let res = syscall!(epoll_wait(
            self.epoll_fd.as_raw_fd(),
            self.events.as_mut_ptr(),
            self.events.len() as libc::c_int,
            timeout_ms,
        ));
        let now = Instant::now();

        match res {
            Ok(num_events) if num_events > 0 => {
                let num_events = num_events as usize;
                trace!("{} events happened", num_events);
                self.fill_active_channels(num_events, active_channels);
                // The kernel may have had more ready descriptors than the
                // array could carry; double so the backlog drains fast.
                if num_events == self.events.len() {
                    let len = self.events.len();
                    self.events.resize(len * 2, new_event(0, 0));
                }
            }
            Ok(_) => trace!("nothing happened"),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => error!("EpollPoller::poll(): {}", err),
        }
        now
    }

    fn update_channel(&mut self, channel: &Rc<Channel>) {
        let index = channel.index();
        let fd = channel.fd();
        trace!(
            "fd = {} events = {{ {} }} index = {}",
            fd,
            channel.events_to_string(),
            index
        );

        if index == INDEX_NEW || index == INDEX_DELETED {
            if index == INDEX_NEW {
                assert!(!self.channels.contains_key(&fd));
                self.channels.insert(fd, Rc::clone(channel));
            } else {
                assert!(self
                    .channels
                    .get(&fd)
                    .is_some_and(|known| Rc::ptr_eq(known, channel)));
            }
            channel.set_index(INDEX_ADDED);
            self.update(libc::EPOLL_CTL_ADD, channel);
        } else {
            assert!(self
                .channels
                .get(&fd)
                .is_some_and(|known| Rc::ptr_eq(known, channel)));
            assert_eq!(index, INDEX_ADDED);
            if channel.is_none_event() {
                self.update(libc::EPOLL_CTL_DEL, channel);
                channel.set_index(INDEX_DELETED);
            } else {
                self.update(libc::EPOLL_CTL_MOD, channel);
            }
        }
    }

    fn remove_channel(&mut self, channel: &Channel) {
        let fd = channel.fd();
        trace!("remove fd = {}", fd);
        assert!(self.channels.contains_key(&fd));
        assert!(channel.is_none_event());

        let index = channel.index();
        assert!(index == INDEX_ADDED || index == INDEX_DELETED);
        self.channels.remove(&fd);

        if index == INDEX_ADDED {
            self.update(libc::EPOLL_CTL_DEL, channel);
        }
        channel.set_index(INDEX_NEW);
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels
            .get(&channel.fd())
            .is_some_and(|known| ptr_eq(known, channel))
    }

    fn channel(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.channels.get(&fd).cloned()
    }
}

fn ptr_eq(known: &Rc<Channel>, channel: &Channel) -> bool {
    std::ptr::eq(Rc::as_ptr(known), channel)
}

fn new_event(events: u32, fd: RawFd) -> libc::epoll_event {
    let mut event: libc::epoll_event = unsafe { std::mem::zeroed() };
    event.events = events;
    event.u64 = fd as u64;
    event
}

fn op_to_string(op: libc::c_int) -> &'static str {
    match op {
        libc::EPOLL_CTL_ADD => "ADD",
        libc::EPOLL_CTL_DEL => "DEL",
        libc::EPOLL_CTL_MOD => "MOD",
        _ => "unknown",
    }
}
