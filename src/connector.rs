use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30 * 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

pub(crate) type NewConnectionCallback = Box<dyn FnMut(&EventLoop, Socket) + Send>;

/// Initiates an outbound TCP connection with capped exponential back-off.
///
/// A socket is one-shot: once a connect attempt fails the descriptor is
/// useless, so every attempt uses a fresh socket and a fresh channel. The
/// connector itself is reusable and restartable.
pub struct Connector {
    self_weak: Weak<Connector>,
    loop_handle: LoopHandle,
    server_addr: SocketAddr,
    connect: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    // Socket of the in-flight attempt while awaiting write readiness.
    attempt: Mutex<Option<Socket>>,
    new_connection_callback: Mutex<Option<NewConnectionCallback>>,
}

impl Connector {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr) -> Arc<Connector> {
        Arc::new_cyclic(|self_weak| Connector {
            self_weak: self_weak.clone(),
            loop_handle,
            server_addr,
            connect: AtomicBool::new(false),
            state: AtomicU8::new(State::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            attempt: Mutex::new(None),
            new_connection_callback: Mutex::new(None),
        })
    }

    /// The callback receives the connected socket; ownership transfers to
    /// the callee.
    pub(crate) fn set_new_connection_callback(
        &self,
        cb: impl FnMut(&EventLoop, Socket) + Send + 'static,
    ) {
        *self.new_connection_callback.lock().unwrap() = Some(Box::new(cb));
    }

    pub fn server_address(&self) -> &SocketAddr {
        &self.server_addr
    }

    /// Starts connecting. Thread safe.
    pub fn start(&self) {
        self.connect.store(true, Ordering::Release);
        let connector = self.self_arc();
        self.loop_handle
            .run_in_loop(move |lp| connector.start_in_loop(lp));
    }

    /// Cancels an in-flight attempt and stops retrying. Thread safe.
    pub fn stop(&self) {
        self.connect.store(false, Ordering::Release);
        let connector = self.self_arc();
        self.loop_handle
            .queue_in_loop(move |lp| connector.stop_in_loop(lp));
    }

    /// Back to the initial delay and a fresh attempt; used by clients
    /// reconnecting after an established connection went down.
    pub fn restart(&self) {
        self.set_state(State::Disconnected);
        self.retry_delay_ms
            .store(INIT_RETRY_DELAY_MS, Ordering::Relaxed);
        self.connect.store(true, Ordering::Release);
        let connector = self.self_arc();
        self.loop_handle
            .run_in_loop(move |lp| connector.start_in_loop(lp));
    }

    fn self_arc(&self) -> Arc<Connector> {
        self.self_weak.upgrade().expect("connector vanished")
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Disconnected,
            1 => State::Connecting,
            _ => State::Connected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        debug_assert_eq!(self.state(), State::Disconnected);
        if self.connect.load(Ordering::Acquire) {
            self.do_connect(lp);
        } else {
            debug!("do not connect");
        }
    }

    fn stop_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        if self.state() == State::Connecting {
            self.set_state(State::Disconnected);
            if let Some(socket) = self.remove_and_reset_channel(lp) {
                self.retry(lp, socket);
            }
        }
    }

    fn do_connect(&self, lp: &EventLoop) {
        let socket = match Socket::new_nonblocking(&self.server_addr) {
            Ok(socket) => socket,
            Err(err) => {
                error!("Connector: cannot create socket: {}", err);
                return;
            }
        };

        match socket.connect(&self.server_addr) {
            Ok(()) => self.connecting(lp, socket),
            Err(err) => match err.raw_os_error() {
                // Connect is under way; completion arrives as write
                // readiness, confirmed by SO_ERROR.
                Some(libc::EINPROGRESS) | Some(libc::EINTR) | Some(libc::EISCONN) => {
                    self.connecting(lp, socket)
                }
                // EAGAIN here means the ephemeral ports are exhausted;
                // close this socket and try again later.
                Some(libc::EAGAIN)
                | Some(libc::EADDRINUSE)
                | Some(libc::EADDRNOTAVAIL)
                | Some(libc::ECONNREFUSED)
                | Some(libc::ENETUNREACH) => self.retry(lp, socket),
                Some(libc::EACCES)
                | Some(libc::EPERM)
                | Some(libc::EAFNOSUPPORT)
                | Some(libc::EALREADY)
                | Some(libc::EBADF)
                | Some(libc::EFAULT)
                | Some(libc::ENOTSOCK) => {
                    error!("connect error in Connector::start_in_loop: {}", err);
                }
                _ => {
                    error!("unexpected error in Connector::start_in_loop: {}", err);
                }
            },
        }
    }

    fn connecting(&self, lp: &EventLoop, socket: Socket) {
        self.set_state(State::Connecting);
        let fd = socket.fd();
        {
            let mut attempt = self.attempt.lock().unwrap();
            debug_assert!(attempt.is_none());
            *attempt = Some(socket);
        }

        let channel = Channel::new(lp, fd);
        let weak = self.self_weak.clone();
        channel.set_write_callback(move |lp| {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write(lp);
            }
        });
        let weak = self.self_weak.clone();
        channel.set_error_callback(move |lp| {
            if let Some(connector) = weak.upgrade() {
                connector.handle_error(lp);
            }
        });
        channel.enable_writing();
    }

    /// Detaches the attempt's channel and returns its socket. The channel
    /// object stays alive until the dispatch pass that called us ends.
    fn remove_and_reset_channel(&self, lp: &EventLoop) -> Option<Socket> {
        let socket = self.attempt.lock().unwrap().take();
        if let Some(socket) = &socket {
            if let Some(channel) = lp.channel_for(socket.fd()) {
                channel.disable_all();
                channel.remove();
            }
        }
        socket
    }

    fn handle_write(&self, lp: &EventLoop) {
        trace!("Connector::handle_write {:?}", self.state());

        if self.state() == State::Connecting {
            let socket = match self.remove_and_reset_channel(lp) {
                Some(socket) => socket,
                None => return,
            };
            // Write readiness alone does not mean the connect succeeded.
            let err = match socket.take_error() {
                Ok(err) => err,
                Err(err) => Some(err),
            };
            if let Some(err) = err {
                warn!("Connector::handle_write - SO_ERROR = {}", err);
                self.retry(lp, socket);
            } else if socket.is_self_connect() {
                warn!("Connector::handle_write - self connect");
                self.retry(lp, socket);
            } else {
                self.set_state(State::Connected);
                if self.connect.load(Ordering::Acquire) {
                    if let Some(cb) = self.new_connection_callback.lock().unwrap().as_mut() {
                        cb(lp, socket);
                    }
                } else {
                    drop(socket);
                }
            }
        } else {
            debug_assert_eq!(self.state(), State::Disconnected);
        }
    }

    fn handle_error(&self, lp: &EventLoop) {
        error!("Connector::handle_error state = {:?}", self.state());
        if self.state() == State::Connecting {
            if let Some(socket) = self.remove_and_reset_channel(lp) {
                if let Ok(Some(err)) = socket.take_error() {
                    trace!("SO_ERROR = {}", err);
                }
                self.retry(lp, socket);
            }
        }
    }

    /// Closes the failed socket and schedules the next attempt with the
    /// doubled, capped delay.
    fn retry(&self, _lp: &EventLoop, socket: Socket) {
        drop(socket);
        self.set_state(State::Disconnected);

        if self.connect.load(Ordering::Acquire) {
            let delay_ms = self.retry_delay_ms.load(Ordering::Relaxed);
            info!(
                "Connector::retry - retry connecting to {} in {} milliseconds",
                self.server_addr, delay_ms
            );
            let weak = self.self_weak.clone();
            self.loop_handle
                .run_after(Duration::from_millis(delay_ms), move |lp| {
                    if let Some(connector) = weak.upgrade() {
                        connector.start_in_loop(lp);
                    }
                });
            self.retry_delay_ms
                .store((delay_ms * 2).min(MAX_RETRY_DELAY_MS), Ordering::Relaxed);
        } else {
            debug!("do not connect");
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        debug_assert!(self.attempt.lock().unwrap().is_none() || !self.connect.load(Ordering::Acquire));
    }
}
