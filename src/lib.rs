//! Reactor-style non-blocking TCP networking for Linux.
//!
//! `muxio` multiplexes many non-blocking TCP connections across a pool of
//! I/O threads using level-triggered readiness notification. Servers and
//! clients are built by registering per-connection callbacks; the runtime
//! owns the descriptors, the event loops, the timers and the lifecycle of
//! every connection.
//!
//! One [`EventLoop`] runs per thread, pinned to the thread that
//! constructed it: it polls for readiness, dispatches each ready
//! [`Channel`] and drains tasks queued from other threads through its
//! [`LoopHandle`]. [`TcpServer`] composes an [`Acceptor`] with an
//! [`EventLoopThreadPool`] and hands each [`TcpConnection`] to a worker
//! loop for life; [`TcpClient`] drives a [`Connector`] with capped
//! exponential back-off.
//!
//! # Example
//!
//! An echo server on a single loop:
//!
//! ```no_run
//! use muxio::{EventLoop, TcpServer};
//!
//! let lp = EventLoop::new().unwrap();
//! let addr = "127.0.0.1:2007".parse().unwrap();
//! let server = TcpServer::new(&lp, &addr, "echo", false).unwrap();
//! server.set_message_callback(|conn, buf, _when| {
//!     let data = buf.take_all();
//!     conn.send(&data);
//! });
//! server.start(&lp).unwrap();
//! lp.run();
//! ```
//!
//! # Readiness mechanism
//!
//! Loops poll with epoll(4) by default; setting the `MUXIO_USE_POLL`
//! environment variable selects the poll(2) variant instead.

#![cfg(target_os = "linux")]

#[macro_use]
mod macros;

mod acceptor;
mod buffer;
mod channel;
mod client;
mod connection;
mod connector;
mod event_loop;
mod poller;
mod server;
mod sys;
mod thread_pool;
mod timer;

pub use acceptor::Acceptor;
pub use buffer::Buffer;
pub use channel::Channel;
pub use client::TcpClient;
pub use connection::{
    default_connection_callback, default_message_callback, ConnectionCallback,
    HighWaterMarkCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
pub use connector::Connector;
pub use event_loop::{EventLoop, LoopHandle};
pub use poller::{EpollPoller, PollPoller, Poller};
pub use server::TcpServer;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use timer::TimerId;
