use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::Weak as SyncWeak;
use std::time::Instant;

use log::{trace, warn};

use crate::event_loop::EventLoop;

// On Linux the poll(2) and epoll(4) event constants have the same values,
// so one mask representation serves both pollers.
const _: () = {
    assert!(libc::EPOLLIN == libc::POLLIN as libc::c_int);
    assert!(libc::EPOLLPRI == libc::POLLPRI as libc::c_int);
    assert!(libc::EPOLLOUT == libc::POLLOUT as libc::c_int);
    assert!(libc::EPOLLRDHUP == libc::POLLRDHUP as libc::c_int);
    assert!(libc::EPOLLERR == libc::POLLERR as libc::c_int);
    assert!(libc::EPOLLHUP == libc::POLLHUP as libc::c_int);
};

pub(crate) const EVENT_NONE: u32 = 0;
pub(crate) const EVENT_READ: u32 = (libc::POLLIN | libc::POLLPRI) as u32;
pub(crate) const EVENT_WRITE: u32 = libc::POLLOUT as u32;

const POLL_IN: u32 = libc::POLLIN as u32;
const POLL_PRI: u32 = libc::POLLPRI as u32;
const POLL_OUT: u32 = libc::POLLOUT as u32;
const POLL_HUP: u32 = libc::POLLHUP as u32;
const POLL_RDHUP: u32 = libc::POLLRDHUP as u32;
const POLL_ERR: u32 = libc::POLLERR as u32;
const POLL_NVAL: u32 = libc::POLLNVAL as u32;

/// Registration tag meaning the poller has never seen this channel.
pub(crate) const INDEX_NEW: i32 = -1;

pub(crate) type ReadEventCallback = Box<dyn FnMut(&EventLoop, Instant)>;
pub(crate) type EventCallback = Box<dyn FnMut(&EventLoop)>;

/// A selectable I/O channel: the binding of one file descriptor to one
/// event loop.
///
/// The channel does not own its descriptor; the descriptor belongs to
/// whichever object created it (socket, event fd, timer fd) and must
/// outlive the registration. Each channel belongs to exactly one loop and
/// is therefore confined to that loop's thread, which is why none of its
/// state needs locking.
///
/// A ready mask reported by the poller is dispatched into up to four
/// callbacks. When the channel is tied to a governing object, dispatch
/// first promotes the tie to a strong reference and does nothing if the
/// object is already gone, so an owner cannot be destroyed midway through
/// its own callback sequence.
pub struct Channel {
    owner: Weak<crate::event_loop::Inner>,
    // Filled by `new_cyclic`; promoted whenever the poller needs a shared
    // handle to this channel.
    self_weak: Weak<Channel>,
    fd: RawFd,
    events: Cell<u32>,
    revents: Cell<u32>,
    // Meaning is private to the poller: the epoll variant stores a
    // registration tag, the poll variant an index into its pollfd vector.
    index: Cell<i32>,
    log_hup: Cell<bool>,
    tied: Cell<bool>,
    tie: RefCell<Option<SyncWeak<dyn Any + Send + Sync>>>,
    event_handling: Cell<bool>,
    added_to_loop: Cell<bool>,
    read_callback: RefCell<Option<ReadEventCallback>>,
    write_callback: RefCell<Option<EventCallback>>,
    close_callback: RefCell<Option<EventCallback>>,
    error_callback: RefCell<Option<EventCallback>>,
}

impl Channel {
    pub fn new(lp: &EventLoop, fd: RawFd) -> Rc<Channel> {
        Rc::new_cyclic(|self_weak| Channel {
            owner: lp.downgrade(),
            self_weak: self_weak.clone(),
            fd,
            events: Cell::new(EVENT_NONE),
            revents: Cell::new(EVENT_NONE),
            index: Cell::new(INDEX_NEW),
            log_hup: Cell::new(true),
            tied: Cell::new(false),
            tie: RefCell::new(None),
            event_handling: Cell::new(false),
            added_to_loop: Cell::new(false),
            read_callback: RefCell::new(None),
            write_callback: RefCell::new(None),
            close_callback: RefCell::new(None),
            error_callback: RefCell::new(None),
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn events(&self) -> u32 {
        self.events.get()
    }

    pub(crate) fn set_revents(&self, revents: u32) {
        self.revents.set(revents);
    }

    pub(crate) fn index(&self) -> i32 {
        self.index.get()
    }

    pub(crate) fn set_index(&self, index: i32) {
        self.index.set(index);
    }

    pub fn is_none_event(&self) -> bool {
        self.events.get() == EVENT_NONE
    }

    pub fn is_reading(&self) -> bool {
        self.events.get() & EVENT_READ != 0
    }

    pub fn is_writing(&self) -> bool {
        self.events.get() & EVENT_WRITE != 0
    }

    pub fn set_read_callback(&self, cb: impl FnMut(&EventLoop, Instant) + 'static) {
        *self.read_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_write_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.write_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_close_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.close_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn set_error_callback(&self, cb: impl FnMut(&EventLoop) + 'static) {
        *self.error_callback.borrow_mut() = Some(Box::new(cb));
    }

    /// Ties this channel to the object governing its callbacks. Dispatch
    /// holds a strong reference to the object for its whole duration.
    pub fn tie<T: Send + Sync + 'static>(&self, obj: &Arc<T>) {
        let weak_typed: SyncWeak<T> = Arc::downgrade(obj);
        let weak: SyncWeak<dyn Any + Send + Sync> = weak_typed;
        *self.tie.borrow_mut() = Some(weak);
        self.tied.set(true);
    }

    pub fn enable_reading(&self) {
        self.events.set(self.events.get() | EVENT_READ);
        self.update();
    }

    pub fn disable_reading(&self) {
        self.events.set(self.events.get() & !EVENT_READ);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.events.set(self.events.get() | EVENT_WRITE);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.events.set(self.events.get() & !EVENT_WRITE);
        self.update();
    }

    pub fn disable_all(&self) {
        self.events.set(EVENT_NONE);
        self.update();
    }

    pub fn do_not_log_hup(&self) {
        self.log_hup.set(false);
    }

    /// Detaches the channel from its poller. Legal only once the interest
    /// mask is empty; must happen before the descriptor closes.
    pub fn remove(&self) {
        assert!(self.is_none_event());
        self.added_to_loop.set(false);
        if let (Some(lp), Some(me)) = (self.owner_loop(), self.self_weak.upgrade()) {
            lp.remove_channel(&me);
        }
    }

    /// Resets registration state without going through the poller; used by
    /// the loop when it tears down its own channels during drop.
    pub(crate) fn clear_for_teardown(&self) {
        self.events.set(EVENT_NONE);
        self.added_to_loop.set(false);
    }

    fn update(&self) {
        self.added_to_loop.set(true);
        if let (Some(lp), Some(me)) = (self.owner_loop(), self.self_weak.upgrade()) {
            lp.update_channel(&me);
        }
    }

    fn owner_loop(&self) -> Option<EventLoop> {
        self.owner.upgrade().map(EventLoop::from_inner)
    }

    /// Dispatches the last ready mask into the callbacks, under the tie
    /// guard when one is set.
    pub(crate) fn handle_event(&self, lp: &EventLoop, receive_time: Instant) {
        if self.tied.get() {
            let guard = self.tie.borrow().as_ref().and_then(SyncWeak::upgrade);
            if let Some(_guard) = guard {
                self.handle_event_with_guard(lp, receive_time);
            }
        } else {
            self.handle_event_with_guard(lp, receive_time);
        }
    }

    fn handle_event_with_guard(&self, lp: &EventLoop, receive_time: Instant) {
        self.event_handling.set(true);
        let revents = self.revents.get();
        trace!("fd = {} handling events {{ {} }}", self.fd, events_to_string(revents));

        // Peer hang-up with nothing left to read closes the channel.
        if revents & POLL_HUP != 0 && revents & POLL_IN == 0 {
            if self.log_hup.get() {
                warn!("fd = {} Channel::handle_event() POLLHUP", self.fd);
            }
            if let Some(cb) = self.close_callback.borrow_mut().as_mut() {
                cb(lp);
            }
        }

        if revents & POLL_NVAL != 0 {
            warn!("fd = {} Channel::handle_event() POLLNVAL", self.fd);
        }

        if revents & (POLL_ERR | POLL_NVAL) != 0 {
            if let Some(cb) = self.error_callback.borrow_mut().as_mut() {
                cb(lp);
            }
        }

        if revents & (POLL_IN | POLL_PRI | POLL_RDHUP) != 0 {
            if let Some(cb) = self.read_callback.borrow_mut().as_mut() {
                cb(lp, receive_time);
            }
        }

        if revents & POLL_OUT != 0 {
            if let Some(cb) = self.write_callback.borrow_mut().as_mut() {
                cb(lp);
            }
        }

        self.event_handling.set(false);
    }

    pub(crate) fn events_to_string(&self) -> String {
        events_to_string(self.events.get())
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.event_handling.get());
        debug_assert!(!self.added_to_loop.get());
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("fd", &self.fd)
            .field("events", &events_to_string(self.events.get()))
            .field("revents", &events_to_string(self.revents.get()))
            .finish()
    }
}

fn events_to_string(events: u32) -> String {
    let mut out = String::new();
    for (bit, name) in [
        (POLL_IN, "IN"),
        (POLL_PRI, "PRI"),
        (POLL_OUT, "OUT"),
        (POLL_HUP, "HUP"),
        (POLL_RDHUP, "RDHUP"),
        (POLL_ERR, "ERR"),
        (POLL_NVAL, "NVAL"),
    ] {
        if events & bit != 0 {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(name);
        }
    }
    out
}
