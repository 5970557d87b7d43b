use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::TimerId;

mod util;
use util::{init_with_loop, quit_after};

#[test]
fn run_after_fires_once() {
    let lp = init_with_loop();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    let start = Instant::now();
    lp.run_after(Duration::from_millis(50), move |lp| {
        fired2.fetch_add(1, Ordering::SeqCst);
        lp.quit();
    });
    quit_after(&lp, 30);
    lp.run();
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn run_at_in_the_past_fires_within_one_iteration() {
    let lp = init_with_loop();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    let start = Instant::now();
    // Already elapsed: the re-arm clamps to just-ahead-of-now instead of
    // never firing.
    lp.run_at(Instant::now() - Duration::from_secs(1), move |lp| {
        fired2.store(true, Ordering::SeqCst);
        lp.quit();
    });
    quit_after(&lp, 30);
    lp.run();
    assert!(fired.load(Ordering::SeqCst));
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn run_every_repeats_until_cancelled() {
    let lp = init_with_loop();
    let count = Arc::new(AtomicUsize::new(0));
    let timer_id: Arc<Mutex<Option<TimerId>>> = Arc::new(Mutex::new(None));

    let count2 = Arc::clone(&count);
    let slot = Arc::clone(&timer_id);
    let id = lp.run_every(Duration::from_millis(10), move |lp| {
        let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
        if n == 3 {
            // Self-cancellation from inside the firing callback.
            let id = slot.lock().unwrap().take().unwrap();
            lp.cancel(id);
        }
    });
    *timer_id.lock().unwrap() = Some(id);

    // Long enough that a fourth firing would have happened many times
    // over if the self-cancel failed.
    lp.run_after(Duration::from_secs(1), |lp| lp.quit());
    lp.run();
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[test]
fn cancel_before_expiration() {
    let lp = init_with_loop();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    let id = lp.run_after(Duration::from_millis(50), move |_| {
        fired2.store(true, Ordering::SeqCst);
    });
    lp.cancel(id);
    lp.run_after(Duration::from_millis(200), |lp| lp.quit());
    lp.run();
    assert!(!fired.load(Ordering::SeqCst));
}

#[test]
fn cancel_of_a_fired_one_shot_is_a_no_op() {
    let lp = init_with_loop();
    let fired = Arc::new(AtomicBool::new(false));
    let fired2 = Arc::clone(&fired);
    let id = lp.run_after(Duration::from_millis(10), move |_| {
        fired2.store(true, Ordering::SeqCst);
    });
    lp.run_after(Duration::from_millis(100), |lp| lp.quit());
    lp.run();
    assert!(fired.load(Ordering::SeqCst));
    // The handle is stale now; cancelling must change nothing and not
    // panic.
    lp.cancel(id);
}

#[test]
fn timers_fire_in_expiration_order() {
    let lp = init_with_loop();
    let order = Arc::new(Mutex::new(Vec::new()));

    for (delay_ms, tag) in [(90u64, 3u32), (30, 1), (60, 2)] {
        let order = Arc::clone(&order);
        lp.run_after(Duration::from_millis(delay_ms), move |_| {
            order.lock().unwrap().push(tag);
        });
    }
    lp.run_after(Duration::from_millis(200), |lp| lp.quit());
    lp.run();
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn timers_can_be_scheduled_from_other_threads() {
    let lp = init_with_loop();
    let handle = lp.handle();
    let fired_on = Arc::new(Mutex::new(None));

    let fired_on2 = Arc::clone(&fired_on);
    let scheduler = thread::spawn(move || {
        handle.run_after(Duration::from_millis(20), move |lp| {
            *fired_on2.lock().unwrap() = Some(thread::current().id());
            lp.quit();
        });
    });

    let loop_thread = thread::current().id();
    quit_after(&lp, 30);
    lp.run();
    scheduler.join().unwrap();
    assert_eq!(*fired_on.lock().unwrap(), Some(loop_thread));
}

#[test]
fn callbacks_can_schedule_more_timers() {
    let lp = init_with_loop();
    let chain = Arc::new(AtomicUsize::new(0));

    let chain2 = Arc::clone(&chain);
    lp.run_after(Duration::from_millis(10), move |lp| {
        chain2.fetch_add(1, Ordering::SeqCst);
        let chain = Arc::clone(&chain2);
        lp.run_after(Duration::from_millis(10), move |lp| {
            chain.fetch_add(1, Ordering::SeqCst);
            lp.quit();
        });
    });

    quit_after(&lp, 30);
    lp.run();
    assert_eq!(chain.load(Ordering::SeqCst), 2);
}
