use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use log::{error, warn};

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys;

/// Timer callbacks run on the owning loop's thread and receive the loop,
/// so they can schedule, cancel or submit further work without capturing
/// loop-local handles.
pub(crate) type TimerCallback = Box<dyn FnMut(&EventLoop) + Send>;

// Sequence numbers are globally unique and strictly increasing; a stale
// `TimerId` can therefore never collide with a later timer.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

/// Opaque handle to a scheduled timer, used only for cancellation.
///
/// The handle stays valid forever: cancelling a timer that already fired
/// (and is not periodic) is a no-op.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct TimerId {
    sequence: u64,
}

impl TimerId {
    pub(crate) fn new(sequence: u64) -> TimerId {
        TimerId { sequence }
    }
}

/// A timer on its way from the scheduling thread to the owning loop.
pub(crate) struct PendingTimer {
    pub(crate) sequence: u64,
    pub(crate) when: Instant,
    pub(crate) interval: Option<Duration>,
    pub(crate) callback: TimerCallback,
}

struct TimerEntry {
    interval: Option<Duration>,
    callback: TimerCallback,
}

/// Best-effort timer queue, driven by one timerfd registered as a channel.
///
/// Two containers share the entries: a `BTreeMap` ordered by
/// `(expiration, sequence)` for expiry processing and a sequence →
/// expiration map for cancellation. They always have the same
/// cardinality. Everything here runs on the owning loop's thread.
pub(crate) struct TimerQueue {
    timer_fd: OwnedFd,
    channel: RefCell<Option<Rc<Channel>>>,
    timers: RefCell<BTreeMap<(Instant, u64), TimerEntry>>,
    active_timers: RefCell<HashMap<u64, Instant>>,
    calling_expired_timers: Cell<bool>,
    canceling_timers: RefCell<HashSet<u64>>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        Ok(TimerQueue {
            timer_fd: sys::create_timer_fd()?,
            channel: RefCell::new(None),
            timers: RefCell::new(BTreeMap::new()),
            active_timers: RefCell::new(HashMap::new()),
            calling_expired_timers: Cell::new(false),
            canceling_timers: RefCell::new(HashSet::new()),
        })
    }

    /// Registers the timerfd's channel with the loop. Split from
    /// construction because the channel needs the loop, which needs the
    /// queue.
    pub(crate) fn register(&self, lp: &EventLoop) {
        let channel = Channel::new(lp, self.timer_fd.as_raw_fd());
        channel.set_read_callback(move |lp, _| lp.process_expired_timers());
        channel.enable_reading();
        *self.channel.borrow_mut() = Some(channel);
    }

    pub(crate) fn take_channel(&self) -> Option<Rc<Channel>> {
        self.channel.borrow_mut().take()
    }

    pub(crate) fn add_timer_in_loop(&self, timer: PendingTimer) {
        let earliest_changed = {
            let mut timers = self.timers.borrow_mut();
            let earliest = timers.keys().next().map(|key| key.0);
            // Re-arm only when the new timer is earlier than the current
            // earliest.
            let changed = earliest.map_or(true, |earliest| timer.when < earliest);
            timers.insert(
                (timer.when, timer.sequence),
                TimerEntry {
                    interval: timer.interval,
                    callback: timer.callback,
                },
            );
            self.active_timers
                .borrow_mut()
                .insert(timer.sequence, timer.when);
            debug_assert_eq!(timers.len(), self.active_timers.borrow().len());
            changed
        };
        if earliest_changed {
            self.reset_timer_fd(timer.when);
        }
    }

    /// Tri-valued cancellation: erase an active timer; mark an expiring
    /// one for destruction (self-cancel); ignore a stale handle.
    pub(crate) fn cancel_in_loop(&self, timer_id: TimerId) {
        let sequence = timer_id.sequence;
        let expiration = self.active_timers.borrow_mut().remove(&sequence);
        match expiration {
            Some(expiration) => {
                let removed = self.timers.borrow_mut().remove(&(expiration, sequence));
                assert!(removed.is_some());
                debug_assert_eq!(
                    self.timers.borrow().len(),
                    self.active_timers.borrow().len()
                );
            }
            None if self.calling_expired_timers.get() => {
                self.canceling_timers.borrow_mut().insert(sequence);
            }
            None => {} // stale handle
        }
    }

    /// Processes the timerfd's read event: drains the descriptor, runs
    /// every expired callback in expiration order, restarts periodic
    /// timers that did not cancel themselves and re-arms the descriptor.
    pub(crate) fn handle_expired(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        self.read_timer_fd();
        let now = Instant::now();

        let mut expired: Vec<((Instant, u64), TimerEntry)> = {
            let mut timers = self.timers.borrow_mut();
            // Everything at `(now, u64::MAX)` or later stays; real keys
            // never carry that sequence.
            let not_expired = timers.split_off(&(now, u64::MAX));
            let expired_map = mem::replace(&mut *timers, not_expired);
            let mut active = self.active_timers.borrow_mut();
            for key in expired_map.keys() {
                active.remove(&key.1);
            }
            expired_map.into_iter().collect()
        };

        self.calling_expired_timers.set(true);
        self.canceling_timers.borrow_mut().clear();
        // Borrows are released above, so callbacks are free to add or
        // cancel timers.
        for ((_, _), entry) in expired.iter_mut() {
            (entry.callback)(lp);
        }
        self.calling_expired_timers.set(false);

        for ((_, sequence), entry) in expired {
            let canceled = self.canceling_timers.borrow().contains(&sequence);
            if let (Some(interval), false) = (entry.interval, canceled) {
                let next = now + interval;
                self.timers.borrow_mut().insert((next, sequence), entry);
                self.active_timers.borrow_mut().insert(sequence, next);
            }
        }
        debug_assert_eq!(self.timers.borrow().len(), self.active_timers.borrow().len());

        let next_expire = self.timers.borrow().keys().next().map(|key| key.0);
        if let Some(when) = next_expire {
            self.reset_timer_fd(when);
        }
    }

    fn read_timer_fd(&self) {
        let mut how_many = [0u8; 8];
        let n = syscall!(read(
            self.timer_fd.as_raw_fd(),
            how_many.as_mut_ptr() as *mut libc::c_void,
            how_many.len(),
        ));
        match n {
            Ok(8) => {}
            Ok(n) => warn!("TimerQueue::handle_expired() reads {} bytes instead of 8", n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TimerQueue::handle_expired() read: {}", err),
        }
    }

    /// Re-arms the descriptor to fire at `when`, clamped at least 100
    /// microseconds into the future so an already-elapsed expiration still
    /// fires within one loop iteration.
    fn reset_timer_fd(&self, when: Instant) {
        let mut delay = when.saturating_duration_since(Instant::now());
        if delay < Duration::from_micros(100) {
            delay = Duration::from_micros(100);
        }
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
        if let Err(err) = syscall!(timerfd_settime(
            self.timer_fd.as_raw_fd(),
            0,
            &new_value,
            std::ptr::null_mut(),
        )) {
            error!("timerfd_settime(): {}", err);
        }
    }
}
