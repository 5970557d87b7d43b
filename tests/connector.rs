use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use muxio::TcpClient;

mod util;
use util::{init_with_loop, quit_after};

#[test]
fn connect_retries_with_back_off_until_the_listener_appears() {
    let lp = init_with_loop();

    // Reserve a port, then free it: connecting to it is refused until the
    // helper thread re-binds below.
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let helper = thread::spawn(move || {
        // Let the first attempt and the 500 ms retry fail first.
        thread::sleep(Duration::from_millis(1200));
        let listener = TcpListener::bind(addr).unwrap();
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"late\n").unwrap();
        // Wait for the client's FIN.
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    let client = TcpClient::new(lp.handle(), addr, "backoff-client");
    let ups = Arc::new(AtomicUsize::new(0));
    let connected_after = Arc::new(Mutex::new(None));
    let started = Instant::now();

    let handle = lp.handle();
    let ups2 = Arc::clone(&ups);
    let connected_after2 = Arc::clone(&connected_after);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            ups2.fetch_add(1, Ordering::SeqCst);
            *connected_after2.lock().unwrap() = Some(started.elapsed());
        } else {
            handle.quit();
        }
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    client.set_message_callback(move |conn, buf, _| {
        received2.lock().unwrap().extend(buf.take_all());
        conn.shutdown();
    });

    client.connect();
    quit_after(&lp, 60);
    lp.run();
    helper.join().unwrap();

    assert_eq!(ups.load(Ordering::SeqCst), 1);
    assert_eq!(received.lock().unwrap().as_slice(), b"late\n");
    // First attempt fails at ~0, the retries run at ~500 ms and ~1.5 s;
    // success cannot come before the listener exists.
    let elapsed = connected_after.lock().unwrap().expect("never connected");
    assert!(elapsed >= Duration::from_millis(1000), "connected after {:?}", elapsed);
}

#[test]
fn stop_abandons_the_attempt() {
    let lp = init_with_loop();

    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let client = TcpClient::new(lp.handle(), addr, "stopped-client");
    let ups = Arc::new(AtomicUsize::new(0));
    let ups2 = Arc::clone(&ups);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            ups2.fetch_add(1, Ordering::SeqCst);
        }
    });

    client.connect();
    lp.run_after(Duration::from_millis(100), {
        let handle = lp.handle();
        move |_| handle.quit()
    });
    client.stop();
    quit_after(&lp, 30);
    lp.run();

    assert_eq!(ups.load(Ordering::SeqCst), 0);
}
