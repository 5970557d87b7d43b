use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use muxio::{Buffer, TcpClient, TcpServer};

mod util;
use util::{any_local_address, init_with_loop, quit_after};

#[test]
fn echo_round_trip() {
    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "echo", false).unwrap();

    let write_completes = Arc::new(AtomicUsize::new(0));
    let wc = Arc::clone(&write_completes);
    server.set_write_complete_callback(move |_| {
        wc.fetch_add(1, Ordering::SeqCst);
    });
    server.set_message_callback(|conn, buf, _| {
        let data = buf.take_all();
        conn.send(&data);
    });
    server.start(&lp).unwrap();

    let client = TcpClient::new(lp.handle(), *server.local_addr(), "echo-client");
    let received = Arc::new(Mutex::new(Vec::new()));
    let downs = Arc::new(AtomicUsize::new(0));

    let handle = lp.handle();
    let downs2 = Arc::clone(&downs);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(b"hello\n");
        } else if downs2.fetch_add(1, Ordering::SeqCst) + 1 == 1 {
            handle.quit();
        }
    });

    let received2 = Arc::clone(&received);
    client.set_message_callback(move |conn, buf, _| {
        assert_eq!(buf.readable_bytes(), 6);
        received2.lock().unwrap().extend(buf.take_all());
        conn.shutdown();
    });

    client.connect();
    quit_after(&lp, 30);
    lp.run();

    assert_eq!(received.lock().unwrap().as_slice(), b"hello\n");
    assert!(write_completes.load(Ordering::SeqCst) >= 1);
}

#[test]
fn send_buffer_drains_the_source() {
    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "sink", false).unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    server.set_message_callback(move |conn, buf, _| {
        received2.lock().unwrap().extend(buf.take_all());
        if received2.lock().unwrap().len() == 12 {
            conn.force_close();
        }
    });
    server.start(&lp).unwrap();

    let client = TcpClient::new(lp.handle(), *server.local_addr(), "buf-client");
    let handle = lp.handle();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            let mut buf = Buffer::new();
            buf.append(b"length-");
            buf.append(b"12345");
            conn.send_buffer(&mut buf);
            assert_eq!(buf.readable_bytes(), 0);
        } else {
            handle.quit();
        }
    });

    client.connect();
    quit_after(&lp, 30);
    lp.run();

    assert_eq!(received.lock().unwrap().as_slice(), b"length-12345");
}

#[test]
fn half_close_delivers_everything_before_the_fin() {
    const TOTAL: usize = 1024 * 1024;

    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "flood", false).unwrap();

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 251) as u8).collect();
    let payload_to_send = payload.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            // Most of this lands in the output buffer; the shutdown must
            // wait for the drain.
            conn.send(&payload_to_send);
            conn.shutdown();
        }
    });
    server.start(&lp).unwrap();

    let client = TcpClient::new(lp.handle(), *server.local_addr(), "flood-client");
    let count = Arc::new(AtomicUsize::new(0));
    let downs = Arc::new(AtomicUsize::new(0));

    let count2 = Arc::clone(&count);
    let expected = payload;
    client.set_message_callback(move |_conn, buf, _| {
        let data = buf.take_all();
        let offset = count2.fetch_add(data.len(), Ordering::SeqCst);
        assert_eq!(&expected[offset..offset + data.len()], &data[..]);
    });

    let handle = lp.handle();
    let count3 = Arc::clone(&count);
    let downs2 = Arc::clone(&downs);
    client.set_connection_callback(move |conn| {
        if !conn.connected() {
            // EOF only after every buffered byte arrived.
            assert_eq!(count3.load(Ordering::SeqCst), TOTAL);
            downs2.fetch_add(1, Ordering::SeqCst);
            handle.quit();
        }
    });

    client.connect();
    quit_after(&lp, 60);
    lp.run();

    assert_eq!(count.load(Ordering::SeqCst), TOTAL);
    assert_eq!(downs.load(Ordering::SeqCst), 1);
}

#[test]
fn high_water_mark_fires_once_per_crossing() {
    const BIG: usize = 16 * 1024 * 1024;
    const SMALL: usize = 2 * 1024;
    const MARK: usize = 1024;

    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "highwater", false).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = Arc::clone(&hits);
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            let hits = Arc::clone(&hits2);
            conn.set_high_water_mark_callback(
                move |_conn, queued| {
                    assert!(queued >= MARK);
                    hits.fetch_add(1, Ordering::SeqCst);
                },
                MARK,
            );
            // The first send crosses the mark; the second stays above it
            // and must not signal again.
            conn.send(&vec![b'x'; BIG]);
            conn.send(&vec![b'y'; SMALL]);
        }
    });
    server.start(&lp).unwrap();

    let client = TcpClient::new(lp.handle(), *server.local_addr(), "highwater-client");
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = Arc::clone(&count);
    client.set_message_callback(move |conn, buf, _| {
        let n = buf.readable_bytes();
        buf.retrieve_all();
        if count2.fetch_add(n, Ordering::SeqCst) + n == BIG + SMALL {
            conn.shutdown();
        }
    });

    let handle = lp.handle();
    client.set_connection_callback(move |conn| {
        if !conn.connected() {
            handle.quit();
        }
    });

    client.connect();
    quit_after(&lp, 120);
    lp.run();

    assert_eq!(count.load(Ordering::SeqCst), BIG + SMALL);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn cross_thread_send_is_uncorrupted() {
    const TOTAL: usize = 256 * 1024;

    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "xthread", false).unwrap();
    server.set_message_callback(|conn, buf, _| {
        let data = buf.take_all();
        conn.send(&data);
    });
    server.start(&lp).unwrap();

    let payload: Vec<u8> = (0..TOTAL).map(|i| (i % 241) as u8).collect();
    let client = TcpClient::new(lp.handle(), *server.local_addr(), "xthread-client");
    let senders: Arc<Mutex<Vec<thread::JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

    let payload_to_send = payload.clone();
    let senders2 = Arc::clone(&senders);
    let handle = lp.handle();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            let conn = Arc::clone(conn);
            let payload = payload_to_send.clone();
            // The payload crosses threads; the runtime must copy it and
            // marshal the write to the loop.
            senders2.lock().unwrap().push(thread::spawn(move || {
                conn.send(&payload);
            }));
        } else {
            handle.quit();
        }
    });

    let received = Arc::new(Mutex::new(Vec::new()));
    let received2 = Arc::clone(&received);
    client.set_message_callback(move |conn, buf, _| {
        received2.lock().unwrap().extend(buf.take_all());
        if received2.lock().unwrap().len() == TOTAL {
            conn.shutdown();
        }
    });

    client.connect();
    quit_after(&lp, 60);
    lp.run();

    for sender in senders.lock().unwrap().drain(..) {
        sender.join().unwrap();
    }
    assert_eq!(received.lock().unwrap().as_slice(), &payload[..]);
}

#[test]
fn client_reconnects_when_retry_is_enabled() {
    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "flaky", false).unwrap();

    let server_ups = Arc::new(AtomicUsize::new(0));
    let server_ups2 = Arc::clone(&server_ups);
    server.set_connection_callback(move |conn| {
        if conn.connected() && server_ups2.fetch_add(1, Ordering::SeqCst) == 0 {
            // Kick the first connection out; the client should come back.
            conn.force_close();
        }
    });
    server.start(&lp).unwrap();

    let client = Arc::new(TcpClient::new(
        lp.handle(),
        *server.local_addr(),
        "retry-client",
    ));
    client.enable_retry();

    let ups = Arc::new(AtomicUsize::new(0));
    let handle = lp.handle();
    let ups2 = Arc::clone(&ups);
    let weak_client = Arc::downgrade(&client);
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            if ups2.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                if let Some(client) = weak_client.upgrade() {
                    client.stop();
                }
                conn.shutdown();
            }
        } else if ups2.load(Ordering::SeqCst) == 2 {
            handle.quit();
        }
    });

    client.connect();
    quit_after(&lp, 60);
    lp.run();

    assert_eq!(ups.load(Ordering::SeqCst), 2);
    assert!(server_ups.load(Ordering::SeqCst) >= 2);
}

#[test]
fn connections_spread_across_worker_loops() {
    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "spread", false).unwrap();
    server.set_thread_num(2);

    let worker_threads = Arc::new(Mutex::new(HashSet::new()));
    let worker_threads2 = Arc::clone(&worker_threads);
    server.set_message_callback(move |conn, buf, _| {
        worker_threads2
            .lock()
            .unwrap()
            .insert(thread::current().id());
        let data = buf.take_all();
        conn.send(&data);
    });
    server.start(&lp).unwrap();

    let addr = *server.local_addr();
    let total_downs = Arc::new(AtomicUsize::new(0));
    let mut clients = Vec::new();
    let handle = lp.handle();

    for i in 0..4 {
        let client = TcpClient::new(lp.handle(), addr, &format!("spread-client-{}", i));
        let message = format!("ping-{}", i).into_bytes();

        let to_send = message.clone();
        let downs = Arc::clone(&total_downs);
        let handle = handle.clone();
        client.set_connection_callback(move |conn| {
            if conn.connected() {
                conn.send(&to_send);
            } else if downs.fetch_add(1, Ordering::SeqCst) + 1 == 4 {
                handle.quit();
            }
        });

        let expected = message;
        client.set_message_callback(move |conn, buf, _| {
            if buf.readable_bytes() < expected.len() {
                return;
            }
            assert_eq!(buf.take_all(), expected);
            conn.shutdown();
        });

        client.connect();
        clients.push(client);
    }

    quit_after(&lp, 60);
    lp.run();

    assert_eq!(total_downs.load(Ordering::SeqCst), 4);
    // Two workers, four connections, round-robin: both workers served.
    assert_eq!(worker_threads.lock().unwrap().len(), 2);
    let main_thread = thread::current().id();
    assert!(!worker_threads.lock().unwrap().contains(&main_thread));
}

#[test]
fn connection_diagnostics() {
    let lp = init_with_loop();
    let server = TcpServer::new(&lp, &any_local_address(), "diag", false).unwrap();

    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.set_tcp_no_delay(true).unwrap();
            let info = conn.tcp_info_string().unwrap();
            assert!(info.contains("rto="));
            assert!(info.contains("cwnd="));
            assert!(conn.local_addr().port() > 0);
            conn.force_close();
        }
    });
    server.start(&lp).unwrap();

    let client = TcpClient::new(lp.handle(), *server.local_addr(), "diag-client");
    let handle = lp.handle();
    client.set_connection_callback(move |conn| {
        if !conn.connected() {
            handle.quit();
        }
    });
    client.connect();
    quit_after(&lp, 30);
    lp.run();
}
