// Not all helpers are used by all test binaries.
#![allow(dead_code)]

use std::sync::Once;
use std::time::Duration;

use muxio::{EventLoop, LoopHandle};

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Creates the loop for the calling thread with logging set up.
pub fn init_with_loop() -> EventLoop {
    init();
    EventLoop::new().expect("unable to create EventLoop")
}

/// Backstop against a hung test: quits the loop after `secs` seconds so a
/// broken scenario fails on its assertions instead of timing out the
/// whole test binary.
pub fn quit_after(lp: &EventLoop, secs: u64) {
    lp.run_after(Duration::from_secs(secs), |lp| lp.quit());
}

/// An address the kernel resolves to a free port on bind.
pub fn any_local_address() -> std::net::SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn assert_send<T: Send>() {}
pub fn assert_sync<T: Sync>() {}

pub fn handle_is_send_sync(_: &LoopHandle) {
    assert_send::<LoopHandle>();
    assert_sync::<LoopHandle>();
}
