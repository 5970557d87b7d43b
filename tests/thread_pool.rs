use std::collections::HashSet;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use muxio::{EventLoopThreadPool, ThreadInitCallback};

mod util;
use util::init_with_loop;

#[test]
fn zero_threads_means_the_base_loop() {
    let lp = init_with_loop();
    let pool = EventLoopThreadPool::new(lp.handle(), "base-only");
    pool.start(None);
    let picked = pool.get_next_loop();
    assert!(picked == lp.handle());
}

#[test]
fn workers_each_run_their_own_loop() {
    let lp = init_with_loop();
    let pool = EventLoopThreadPool::new(lp.handle(), "workers");
    pool.set_thread_num(3);
    pool.start(None);

    let (tx, rx) = mpsc::channel();
    for _ in 0..3 {
        let tx = tx.clone();
        pool.get_next_loop().run_in_loop(move |_| {
            tx.send(thread::current().id()).unwrap();
        });
    }

    let mut threads = HashSet::new();
    for _ in 0..3 {
        threads.insert(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }
    assert_eq!(threads.len(), 3);
    assert!(!threads.contains(&thread::current().id()));
}

#[test]
fn round_robin_wraps() {
    let lp = init_with_loop();
    let pool = EventLoopThreadPool::new(lp.handle(), "rr");
    pool.set_thread_num(2);
    pool.start(None);

    let first = pool.get_next_loop();
    let second = pool.get_next_loop();
    let third = pool.get_next_loop();
    assert!(first != second);
    assert!(first == third);
}

#[test]
fn hashed_selection_is_sticky() {
    let lp = init_with_loop();
    let pool = EventLoopThreadPool::new(lp.handle(), "hash");
    pool.set_thread_num(3);
    pool.start(None);

    let a = pool.get_loop_for_hash(7);
    let b = pool.get_loop_for_hash(7);
    let c = pool.get_loop_for_hash(8);
    assert!(a == b);
    // 7 and 8 land on neighbouring loops.
    assert!(a != c);
}

#[test]
fn init_callback_runs_on_each_worker_before_the_loop() {
    let lp = init_with_loop();
    let pool = EventLoopThreadPool::new(lp.handle(), "init");
    pool.set_thread_num(2);

    let (tx, rx) = mpsc::channel();
    let tx = std::sync::Mutex::new(tx);
    let init: ThreadInitCallback = std::sync::Arc::new(move |_lp: &muxio::EventLoop| {
        tx.lock().unwrap().send(thread::current().id()).unwrap();
    });
    pool.start(Some(init));

    let mut threads = HashSet::new();
    for _ in 0..2 {
        threads.insert(rx.recv_timeout(Duration::from_secs(10)).unwrap());
    }
    assert_eq!(threads.len(), 2);
    assert!(!threads.contains(&thread::current().id()));
}
