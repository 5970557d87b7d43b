use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use log::debug;

use crate::event_loop::{EventLoop, LoopHandle};

/// Runs on each worker thread after its loop is constructed and before the
/// loop starts cycling.
pub type ThreadInitCallback = Arc<dyn Fn(&EventLoop) + Send + Sync>;

/// A thread owning one event loop.
///
/// The loop is constructed on the spawned thread (loops pin to their
/// constructing thread) and its handle is published back through a
/// one-shot channel. Dropping the `EventLoopThread` quits the loop and
/// joins the thread.
pub struct EventLoopThread {
    handle: LoopHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    pub fn start(name: String, init: Option<ThreadInitCallback>) -> EventLoopThread {
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || {
                let lp = EventLoop::new().expect("failed to create worker event loop");
                if let Some(init) = &init {
                    init(&lp);
                }
                // The handle crosses to `start`; the loop itself lives and
                // dies on this stack frame.
                tx.send(lp.handle()).expect("loop owner went away");
                lp.run();
            })
            .expect("failed to spawn event-loop thread");
        let handle = rx.recv().expect("worker event loop never started");
        EventLoopThread {
            handle,
            thread: Some(thread),
        }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Worker pool distributing connections across event loops.
///
/// With zero threads the base loop carries everything. Selection is
/// round-robin through [`get_next_loop`](EventLoopThreadPool::get_next_loop)
/// or content-hashed through
/// [`get_loop_for_hash`](EventLoopThreadPool::get_loop_for_hash) for
/// affinity.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    started: AtomicBool,
    num_threads: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<EventLoopThread>>,
    loops: Mutex<Vec<LoopHandle>>,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            started: AtomicBool::new(false),
            num_threads: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Number of worker threads; zero keeps everything on the base loop.
    /// Must be called before [`start`](EventLoopThreadPool::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        assert!(!self.started());
        self.num_threads.store(num_threads, Ordering::Relaxed);
    }

    pub fn start(&self, init: Option<ThreadInitCallback>) {
        assert!(!self.started.swap(true, Ordering::AcqRel));
        assert!(self.base.is_in_loop_thread());

        let num_threads = self.num_threads.load(Ordering::Relaxed);
        debug!("EventLoopThreadPool [{}] starting {} threads", self.name, num_threads);

        for i in 0..num_threads {
            let thread = EventLoopThread::start(format!("{}{}", self.name, i), init.clone());
            self.loops.lock().unwrap().push(thread.handle().clone());
            self.threads.lock().unwrap().push(thread);
        }

        if num_threads == 0 {
            if let (Some(init), Some(lp)) = (init, EventLoop::current()) {
                init(&lp);
            }
        }
    }

    /// Picks the loop for a new connection, round-robin. Valid after
    /// [`start`](EventLoopThreadPool::start); called on the base loop.
    pub fn get_next_loop(&self) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        assert!(self.started());
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base.clone()
        } else {
            let next = self.next.fetch_add(1, Ordering::Relaxed);
            loops[next % loops.len()].clone()
        }
    }

    /// Same hash code, same loop.
    pub fn get_loop_for_hash(&self, hash_code: usize) -> LoopHandle {
        assert!(self.base.is_in_loop_thread());
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            self.base.clone()
        } else {
            loops[hash_code % loops.len()].clone()
        }
    }

    pub fn get_all_loops(&self) -> Vec<LoopHandle> {
        let loops = self.loops.lock().unwrap();
        if loops.is_empty() {
            vec![self.base.clone()]
        } else {
            loops.clone()
        }
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}
