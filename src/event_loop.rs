use std::cell::{Cell, RefCell};
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace};

use crate::channel::Channel;
use crate::poller::{new_default_poller, Poller};
use crate::sys;
use crate::timer::{self, PendingTimer, TimerCallback, TimerId, TimerQueue};

thread_local! {
    static CURRENT_LOOP: RefCell<Weak<Inner>> = RefCell::new(Weak::new());
}

const POLL_TIME_MS: i32 = 10_000;

/// A task submitted to a loop from any thread; it runs on the loop thread
/// and receives the loop, so loop-local structures need no locks.
pub(crate) type Task = Box<dyn FnOnce(&EventLoop) + Send>;

/// One reactor: a poller, a timer queue, a wake-up descriptor and a task
/// queue, pinned to the thread that constructed it.
///
/// At most one `EventLoop` exists per thread. Apart from the explicitly
/// thread-safe surface exposed through [`LoopHandle`], every method must
/// be called from the loop's own thread; violations panic with a
/// diagnostic.
///
/// The cycle in [`run`](EventLoop::run) is: poll for readiness, dispatch
/// each ready channel, then drain tasks queued from other threads.
pub struct EventLoop {
    inner: Rc<Inner>,
}

pub(crate) struct Inner {
    shared: Arc<Shared>,
    poller: RefCell<Box<dyn Poller>>,
    timers: TimerQueue,
    active_channels: RefCell<Vec<Rc<Channel>>>,
    current_active: Cell<RawFd>,
    looping: Cell<bool>,
    event_handling: Cell<bool>,
    iteration: Cell<u64>,
    poll_return_time: Cell<Instant>,
    wakeup_channel: RefCell<Option<Rc<Channel>>>,
}

/// The cross-thread part of a loop.
struct Shared {
    thread: ThreadId,
    quit: AtomicBool,
    calling_pending_tasks: AtomicBool,
    pending_tasks: Mutex<Vec<Task>>,
    wakeup_fd: OwnedFd,
}

impl EventLoop {
    /// Creates the loop for the current thread.
    ///
    /// Fails if the readiness, wake-up or timer descriptor cannot be
    /// created; callers treat that as fatal. Panics if the thread already
    /// has a loop.
    pub fn new() -> io::Result<EventLoop> {
        sys::ignore_sigpipe();

        CURRENT_LOOP.with(|current| {
            assert!(
                current.borrow().upgrade().is_none(),
                "another EventLoop already exists in this thread"
            );
        });

        let inner = Rc::new(Inner {
            shared: Arc::new(Shared {
                thread: thread::current().id(),
                quit: AtomicBool::new(false),
                calling_pending_tasks: AtomicBool::new(false),
                pending_tasks: Mutex::new(Vec::new()),
                wakeup_fd: sys::create_event_fd()?,
            }),
            poller: RefCell::new(new_default_poller()?),
            timers: TimerQueue::new()?,
            active_channels: RefCell::new(Vec::new()),
            current_active: Cell::new(-1),
            looping: Cell::new(false),
            event_handling: Cell::new(false),
            iteration: Cell::new(0),
            poll_return_time: Cell::new(Instant::now()),
            wakeup_channel: RefCell::new(None),
        });

        CURRENT_LOOP.with(|current| *current.borrow_mut() = Rc::downgrade(&inner));
        debug!(
            "EventLoop created in thread {:?}",
            inner.shared.thread
        );

        let lp = EventLoop { inner };

        // The wake-up descriptor is observed like any other channel; its
        // read callback just drains the eventfd counter.
        let wakeup_channel = Channel::new(&lp, lp.inner.shared.wakeup_fd.as_raw_fd());
        wakeup_channel.set_read_callback(|lp, _| lp.handle_wakeup_read());
        wakeup_channel.enable_reading();
        *lp.inner.wakeup_channel.borrow_mut() = Some(wakeup_channel);

        lp.inner.timers.register(&lp);

        Ok(lp)
    }

    pub(crate) fn from_inner(inner: Rc<Inner>) -> EventLoop {
        EventLoop { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<Inner> {
        Rc::downgrade(&self.inner)
    }

    /// The loop running on the current thread, if any.
    pub(crate) fn current() -> Option<EventLoop> {
        CURRENT_LOOP.with(|current| {
            current
                .borrow()
                .upgrade()
                .map(|inner| EventLoop { inner })
        })
    }

    /// Runs the poll → dispatch → drain cycle until [`quit`] is called.
    ///
    /// [`quit`]: LoopHandle::quit
    pub fn run(&self) {
        assert!(!self.inner.looping.get(), "re-entrant EventLoop::run()");
        self.assert_in_loop_thread();
        self.inner.looping.set(true);
        trace!("EventLoop start looping");

        while !self.inner.shared.quit.load(Ordering::Acquire) {
            let poll_return_time = {
                let mut active = self.inner.active_channels.borrow_mut();
                active.clear();
                self.inner.poller.borrow_mut().poll(POLL_TIME_MS, &mut active)
            };
            self.inner.poll_return_time.set(poll_return_time);
            self.inner.iteration.set(self.inner.iteration.get() + 1);

            self.inner.event_handling.set(true);
            // Dispatch from a clone so callbacks that unregister channels
            // do not race the list; the clone also keeps a channel (and
            // its callbacks) alive until after the whole dispatch pass.
            let active: Vec<Rc<Channel>> = self.inner.active_channels.borrow().clone();
            for channel in &active {
                self.inner.current_active.set(channel.fd());
                channel.handle_event(self, poll_return_time);
            }
            self.inner.current_active.set(-1);
            self.inner.event_handling.set(false);

            self.do_pending_tasks();
        }

        trace!("EventLoop stop looping");
        self.inner.looping.set(false);
    }

    /// Stops the loop after the current iteration. Callable from any
    /// thread via [`LoopHandle::quit`].
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Runs `f` immediately when called on the loop thread, otherwise
    /// queues it.
    pub fn run_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            f(self);
        } else {
            self.queue_in_loop(f);
        }
    }

    /// Queues `f` to run in the loop thread after the current iteration's
    /// dispatch.
    pub fn queue_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        self.handle().queue_in_loop(f);
    }

    pub fn run_at(
        &self,
        when: Instant,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.handle().run_at(when, callback)
    }

    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.handle().run_after(delay, callback)
    }

    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.handle().run_every(interval, callback)
    }

    pub fn cancel(&self, timer_id: TimerId) {
        self.handle().cancel(timer_id)
    }

    /// A clonable, `Send + Sync` handle carrying the thread-safe surface
    /// of this loop.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: Arc::clone(&self.inner.shared),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.inner.shared.thread
    }

    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop was created in thread {:?}, called from thread {:?}",
                self.inner.shared.thread,
                thread::current().id()
            );
        }
    }

    /// Number of completed poll cycles.
    pub fn iteration(&self) -> u64 {
        self.inner.iteration.get()
    }

    /// Timestamp returned by the most recent poll.
    pub fn poll_return_time(&self) -> Instant {
        self.inner.poll_return_time.get()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.shared.pending_tasks.lock().unwrap().len()
    }

    pub(crate) fn update_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        self.inner.poller.borrow_mut().update_channel(channel);
    }

    pub(crate) fn remove_channel(&self, channel: &Rc<Channel>) {
        self.assert_in_loop_thread();
        if self.inner.event_handling.get() {
            debug_assert!(
                self.inner.current_active.get() == channel.fd()
                    || !self
                        .inner
                        .active_channels
                        .borrow()
                        .iter()
                        .any(|c| Rc::ptr_eq(c, channel)),
                "channel removed mid-dispatch while still pending"
            );
        }
        self.inner.poller.borrow_mut().remove_channel(channel);
    }

    pub fn has_channel(&self, channel: &Rc<Channel>) -> bool {
        self.assert_in_loop_thread();
        self.inner.poller.borrow().has_channel(channel)
    }

    /// The registered channel observing `fd`, if any.
    pub(crate) fn channel_for(&self, fd: RawFd) -> Option<Rc<Channel>> {
        self.inner.poller.borrow().channel(fd)
    }

    pub(crate) fn add_timer_in_loop(&self, timer: PendingTimer) {
        self.assert_in_loop_thread();
        self.inner.timers.add_timer_in_loop(timer);
    }

    pub(crate) fn cancel_timer_in_loop(&self, timer_id: TimerId) {
        self.assert_in_loop_thread();
        self.inner.timers.cancel_in_loop(timer_id);
    }

    pub(crate) fn process_expired_timers(&self) {
        self.inner.timers.handle_expired(self);
    }

    fn handle_wakeup_read(&self) {
        let mut one = [0u8; 8];
        match syscall!(read(
            self.inner.shared.wakeup_fd.as_raw_fd(),
            one.as_mut_ptr() as *mut libc::c_void,
            one.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("EventLoop wake-up read returns {} bytes instead of 8", n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("EventLoop wake-up read: {}", err),
        }
    }

    /// Swap the queue out under the lock, then run the tasks unlocked:
    /// tasks may queue further tasks without deadlock, and the critical
    /// section stays bounded.
    fn do_pending_tasks(&self) {
        self.inner
            .shared
            .calling_pending_tasks
            .store(true, Ordering::Release);
        let tasks = mem::take(&mut *self.inner.shared.pending_tasks.lock().unwrap());
        for task in tasks {
            task(self);
        }
        self.inner
            .shared
            .calling_pending_tasks
            .store(false, Ordering::Release);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // The channels cannot go through `Channel::remove` here: their
        // weak reference to this loop is already unusable. Detach them
        // from the poller directly, before their descriptors close.
        let mut teardown = Vec::new();
        if let Some(channel) = self.wakeup_channel.borrow_mut().take() {
            teardown.push(channel);
        }
        if let Some(channel) = self.timers.take_channel() {
            teardown.push(channel);
        }
        for channel in teardown {
            channel.clear_for_teardown();
            let mut poller = self.poller.borrow_mut();
            poller.update_channel(&channel);
            poller.remove_channel(&channel);
        }
        CURRENT_LOOP.with(|current| *current.borrow_mut() = Weak::new());
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("thread", &self.inner.shared.thread)
            .field("iteration", &self.inner.iteration.get())
            .finish()
    }
}

/// The thread-safe surface of an [`EventLoop`].
///
/// Handles are cheap to clone and outliving the loop is harmless: tasks
/// and timers submitted to a dead loop are silently dropped.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<Shared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread
    }

    /// Runs `f` synchronously when called on the loop thread, otherwise
    /// queues it for the loop and wakes the loop up.
    pub fn run_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        if self.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                if Arc::ptr_eq(&lp.inner.shared, &self.shared) {
                    f(&lp);
                    return;
                }
            }
            // The loop is already gone; nothing left to run the task on.
            return;
        }
        self.queue_in_loop(f);
    }

    /// Queues `f` for the loop thread. Wakes the loop when the caller is
    /// foreign or when the loop is currently draining tasks (the next poll
    /// would otherwise sleep on `f`).
    pub fn queue_in_loop(&self, f: impl FnOnce(&EventLoop) + Send + 'static) {
        {
            let mut pending = self.shared.pending_tasks.lock().unwrap();
            pending.push(Box::new(f));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending_tasks.load(Ordering::Acquire) {
            self.wake();
        }
    }

    /// Stops the loop after its current iteration completes.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wake();
        }
    }

    /// Schedules `callback` at `when`. Thread safe.
    pub fn run_at(
        &self,
        when: Instant,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.add_timer(when, None, Box::new(callback))
    }

    /// Schedules `callback` after `delay`. Thread safe.
    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.add_timer(Instant::now() + delay, None, Box::new(callback))
    }

    /// Schedules `callback` every `interval`, first firing one interval
    /// from now. Thread safe.
    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut(&EventLoop) + Send + 'static,
    ) -> TimerId {
        self.add_timer(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    /// Cancels a timer. A handle to an already-fired one-shot timer is
    /// stale and the call is a no-op; a periodic timer cancelling itself
    /// from its own callback never fires again.
    pub fn cancel(&self, timer_id: TimerId) {
        self.run_in_loop(move |lp| lp.cancel_timer_in_loop(timer_id));
    }

    pub fn queue_size(&self) -> usize {
        self.shared.pending_tasks.lock().unwrap().len()
    }

    fn add_timer(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerId {
        let sequence = timer::next_sequence();
        let pending = PendingTimer {
            sequence,
            when,
            interval,
            callback,
        };
        self.run_in_loop(move |lp| lp.add_timer_in_loop(pending));
        TimerId::new(sequence)
    }

    /// Makes the loop's next (or current) poll return immediately.
    fn wake(&self) {
        let one: u64 = 1;
        let buf = one.to_ne_bytes();
        match syscall!(write(
            self.shared.wakeup_fd.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )) {
            Ok(8) => {}
            Ok(n) => error!("LoopHandle::wake() writes {} bytes instead of 8", n),
            // The counter is saturated; the loop has an unread wake-up
            // already, which is all a wake needs.
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("LoopHandle::wake(): {}", err),
        }
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle")
            .field("thread", &self.shared.thread)
            .finish()
    }
}

impl PartialEq for LoopHandle {
    fn eq(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}
