use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;

/// Fires when a connection finishes establishing and again when it goes
/// down; distinguish with [`TcpConnection::connected`].
pub type ConnectionCallback = dyn Fn(&Arc<TcpConnection>) + Send + Sync;
/// Fires on arrived bytes, with a borrow of the input buffer and the
/// poll-return timestamp. The callee consumes what it can and leaves the
/// rest buffered.
pub type MessageCallback = dyn Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync;
/// Fires when the output buffer drains completely, never inline from
/// `send`.
pub type WriteCompleteCallback = dyn Fn(&Arc<TcpConnection>) + Send + Sync;
/// Fires once per upward crossing of the high-water mark, with the queued
/// size.
pub type HighWaterMarkCallback = dyn Fn(&Arc<TcpConnection>, usize) + Send + Sync;
pub(crate) type CloseCallback = dyn Fn(&Arc<TcpConnection>) + Send + Sync;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Logs the transition; installed when the user sets no connection
/// callback.
pub fn default_connection_callback(conn: &Arc<TcpConnection>) {
    trace!(
        "{} -> {} is {}",
        conn.local_addr(),
        conn.peer_addr(),
        if conn.connected() { "UP" } else { "DOWN" }
    );
}

/// Discards arrived bytes; installed when the user sets no message
/// callback.
pub fn default_message_callback(_conn: &Arc<TcpConnection>, buf: &mut Buffer, _when: Instant) {
    buf.retrieve_all();
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd)]
#[repr(u8)]
enum State {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

#[derive(Default)]
struct Callbacks {
    connection: Option<Arc<ConnectionCallback>>,
    message: Option<Arc<MessageCallback>>,
    write_complete: Option<Arc<WriteCompleteCallback>>,
    high_water_mark: Option<Arc<HighWaterMarkCallback>>,
    close: Option<Arc<CloseCallback>>,
}

/// One established TCP connection: owns the socket and its channel,
/// buffers input and output, enforces half-close ordering and surfaces
/// the user callbacks.
///
/// Shared between the owning loop and the user; the connection lives as
/// long as the longest holder. The descriptor closes only when the last
/// handle drops, which makes leaks easy to spot.
///
/// State advances monotonically Connecting → Connected → Disconnecting →
/// Disconnected and is written only on the loop thread; [`send`] and
/// friends read it from other threads as a best-effort early return.
///
/// Thread-safe entry points: [`send`], [`shutdown`], [`force_close`],
/// [`force_close_with_delay`], [`start_read`], [`stop_read`]. Everything
/// else runs on the owning loop.
///
/// [`send`]: TcpConnection::send
/// [`shutdown`]: TcpConnection::shutdown
/// [`force_close`]: TcpConnection::force_close
/// [`force_close_with_delay`]: TcpConnection::force_close_with_delay
/// [`start_read`]: TcpConnection::start_read
/// [`stop_read`]: TcpConnection::stop_read
pub struct TcpConnection {
    self_weak: Weak<TcpConnection>,
    loop_handle: LoopHandle,
    name: String,
    state: AtomicU8,
    reading: AtomicBool,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    // Locked only on the loop thread; two separate locks so the message
    // callback can send on its own connection.
    input_buffer: Mutex<Buffer>,
    output_buffer: Mutex<Buffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl TcpConnection {
    /// Takes over an accepted or just-connected non-blocking socket.
    /// Called by `TcpServer` and `TcpClient`; user code receives
    /// connections through callbacks instead of constructing them.
    pub fn new(
        loop_handle: LoopHandle,
        name: String,
        socket: Socket,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Arc<TcpConnection> {
        debug!("TcpConnection::new [{}] fd = {}", name, socket.fd());
        if let Err(err) = socket.set_keep_alive(true) {
            warn!("TcpConnection [{}]: SO_KEEPALIVE: {}", name, err);
        }
        Arc::new_cyclic(|self_weak| TcpConnection {
            self_weak: self_weak.clone(),
            loop_handle,
            name,
            state: AtomicU8::new(State::Connecting as u8),
            reading: AtomicBool::new(true),
            socket,
            local_addr,
            peer_addr,
            input_buffer: Mutex::new(Buffer::new()),
            output_buffer: Mutex::new(Buffer::new()),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            callbacks: Mutex::new(Callbacks::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> &SocketAddr {
        &self.local_addr
    }

    pub fn peer_addr(&self) -> &SocketAddr {
        &self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn connected(&self) -> bool {
        self.state() == State::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == State::Disconnected
    }

    pub fn set_connection_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        self.callbacks.lock().unwrap().write_complete = Some(Arc::new(cb));
    }

    /// The mark only signals the upward crossing; the connection keeps
    /// buffering. Interpreting the signal is the caller's business.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, usize) + Send + Sync + 'static,
        high_water_mark: usize,
    ) {
        self.high_water_mark.store(high_water_mark, Ordering::Relaxed);
        self.callbacks.lock().unwrap().high_water_mark = Some(Arc::new(cb));
    }

    pub(crate) fn set_connection_callback_shared(&self, cb: Option<Arc<ConnectionCallback>>) {
        self.callbacks.lock().unwrap().connection = cb;
    }

    pub(crate) fn set_message_callback_shared(&self, cb: Option<Arc<MessageCallback>>) {
        self.callbacks.lock().unwrap().message = cb;
    }

    pub(crate) fn set_write_complete_callback_shared(
        &self,
        cb: Option<Arc<WriteCompleteCallback>>,
    ) {
        self.callbacks.lock().unwrap().write_complete = cb;
    }

    pub(crate) fn set_close_callback(&self, cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().close = Some(Arc::new(cb));
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_tcp_no_delay(on)
    }

    /// Kernel TCP diagnostics (retransmits, RTO, MSS, RTT, cwnd, ...) as a
    /// formatted string.
    pub fn tcp_info_string(&self) -> io::Result<String> {
        self.socket.tcp_info_string()
    }

    pub fn input_buffer_len(&self) -> usize {
        self.input_buffer.lock().unwrap().readable_bytes()
    }

    pub fn output_buffer_len(&self) -> usize {
        self.output_buffer.lock().unwrap().readable_bytes()
    }

    /// Sends `data`, buffering whatever the socket does not take at once.
    /// Thread safe: off the loop thread the bytes are copied and the write
    /// is marshalled to the loop.
    pub fn send(&self, data: &[u8]) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, data);
                return;
            }
        }
        let message = data.to_vec();
        let conn = self.self_arc();
        self.loop_handle
            .run_in_loop(move |lp| conn.send_in_loop(lp, &message));
    }

    /// Sends and drains the readable span of `buf`.
    pub fn send_buffer(&self, buf: &mut Buffer) {
        if self.state() != State::Connected {
            return;
        }
        if self.loop_handle.is_in_loop_thread() {
            if let Some(lp) = EventLoop::current() {
                self.send_in_loop(&lp, buf.peek());
                buf.retrieve_all();
                return;
            }
        }
        let message = buf.take_all();
        let conn = self.self_arc();
        self.loop_handle
            .run_in_loop(move |lp| conn.send_in_loop(lp, &message));
    }

    /// Half-closes the write side once everything queued has been
    /// delivered, so the peer sees all buffered bytes before the FIN.
    /// Thread safe.
    pub fn shutdown(&self) {
        if self.compare_and_set_state(State::Connected, State::Disconnecting) {
            let conn = self.self_arc();
            self.loop_handle
                .run_in_loop(move |lp| conn.shutdown_in_loop(lp));
        }
    }

    /// Closes regardless of unsent data. Thread safe.
    pub fn force_close(&self) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let conn = self.self_arc();
            self.loop_handle
                .queue_in_loop(move |lp| conn.force_close_in_loop(lp));
        }
    }

    /// Force-closes after `delay`. The timer holds only a weak reference,
    /// so it never extends the connection's lifetime. Thread safe.
    pub fn force_close_with_delay(&self, delay: Duration) {
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnecting);
            let weak = self.self_weak.clone();
            self.loop_handle.run_after(delay, move |_| {
                if let Some(conn) = weak.upgrade() {
                    conn.force_close();
                }
            });
        }
    }

    /// Re-enables read interest. Thread safe.
    pub fn start_read(&self) {
        let conn = self.self_arc();
        self.loop_handle.run_in_loop(move |lp| {
            lp.assert_in_loop_thread();
            if !conn.reading.load(Ordering::Relaxed) {
                if let Some(channel) = lp.channel_for(conn.fd()) {
                    if !channel.is_reading() {
                        channel.enable_reading();
                    }
                }
                conn.reading.store(true, Ordering::Relaxed);
            }
        });
    }

    /// Stops observing readability; arriving bytes stay in the kernel.
    /// Thread safe.
    pub fn stop_read(&self) {
        let conn = self.self_arc();
        self.loop_handle.run_in_loop(move |lp| {
            lp.assert_in_loop_thread();
            if conn.reading.load(Ordering::Relaxed) {
                if let Some(channel) = lp.channel_for(conn.fd()) {
                    if channel.is_reading() {
                        channel.disable_reading();
                    }
                }
                conn.reading.store(false, Ordering::Relaxed);
            }
        });
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::Relaxed)
    }

    /// One-shot; runs on the owning loop when the server or client hands
    /// the connection over. Installs the channel, ties it and reports up.
    pub fn connect_established(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        assert_eq!(self.state(), State::Connecting);
        self.set_state(State::Connected);

        let channel = Channel::new(lp, self.fd());
        let weak = self.self_weak.clone();
        channel.set_read_callback(move |lp, receive_time| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_read(lp, receive_time);
            }
        });
        let weak = self.self_weak.clone();
        channel.set_write_callback(move |lp| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_write(lp);
            }
        });
        let weak = self.self_weak.clone();
        channel.set_close_callback(move |lp| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_close(lp);
            }
        });
        let weak = self.self_weak.clone();
        channel.set_error_callback(move |lp| {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error(lp);
            }
        });
        // The tie keeps the connection alive through its own callback
        // sequence even if every other holder lets go mid-dispatch.
        channel.tie(&self.self_arc());
        channel.enable_reading();

        self.run_connection_callback(&self.self_arc());
    }

    /// One-shot; the final word from the owning loop. Reports down when
    /// the close path has not already done so and detaches the channel.
    pub fn connect_destroyed(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.set_state(State::Disconnected);
            if let Some(channel) = lp.channel_for(self.fd()) {
                channel.disable_all();
            }
            self.run_connection_callback(&self.self_arc());
        }
        if let Some(channel) = lp.channel_for(self.fd()) {
            channel.disable_all();
            channel.remove();
        }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    fn self_arc(&self) -> Arc<TcpConnection> {
        self.self_weak.upgrade().expect("connection vanished")
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::Acquire) {
            0 => State::Connecting,
            1 => State::Connected,
            2 => State::Disconnecting,
            _ => State::Disconnected,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn compare_and_set_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn run_connection_callback(&self, conn: &Arc<TcpConnection>) {
        let cb = self.callbacks.lock().unwrap().connection.clone();
        match cb {
            Some(cb) => cb(conn),
            None => default_connection_callback(conn),
        }
    }

    /// One scatter read per readiness notification; under level-triggered
    /// polling the kernel re-reports leftovers, and reading until EAGAIN
    /// would starve the other connections on this loop.
    fn handle_read(&self, lp: &EventLoop, receive_time: Instant) {
        lp.assert_in_loop_thread();
        let mut input = self.input_buffer.lock().unwrap();
        match input.read_fd(self.fd()) {
            Ok(0) => {
                drop(input);
                self.handle_close(lp);
            }
            Ok(_) => {
                let cb = self.callbacks.lock().unwrap().message.clone();
                let conn = self.self_arc();
                match cb {
                    Some(cb) => cb(&conn, &mut input, receive_time),
                    None => default_message_callback(&conn, &mut input, receive_time),
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                drop(input);
                error!("TcpConnection::handle_read [{}]: {}", self.name, err);
                self.handle_error(lp);
            }
        }
    }

    /// Drains the output buffer on writability. On complete drain the
    /// write interest goes away (otherwise the loop would spin on an
    /// always-writable socket) and a deferred shutdown completes the
    /// half-close.
    fn handle_write(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let channel = match lp.channel_for(self.fd()) {
            Some(channel) => channel,
            None => return,
        };
        if !channel.is_writing() {
            trace!("connection fd = {} is down, no more writing", self.fd());
            return;
        }

        let mut output = self.output_buffer.lock().unwrap();
        match self.socket.write(output.peek()) {
            Ok(n) => {
                output.retrieve(n);
                if output.readable_bytes() == 0 {
                    channel.disable_writing();
                    let cb = self.callbacks.lock().unwrap().write_complete.clone();
                    if let Some(cb) = cb {
                        let conn = self.self_arc();
                        lp.queue_in_loop(move |_| cb(&conn));
                    }
                    if self.state() == State::Disconnecting {
                        drop(output);
                        self.shutdown_in_loop(lp);
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => error!("TcpConnection::handle_write [{}]: {}", self.name, err),
        }
    }

    fn handle_close(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let state = self.state();
        trace!("fd = {} state = {:?}", self.fd(), state);
        assert!(state == State::Connected || state == State::Disconnecting);

        // The descriptor is not closed here; it goes with the connection
        // object itself.
        self.set_state(State::Disconnected);
        if let Some(channel) = lp.channel_for(self.fd()) {
            channel.disable_all();
        }

        let guard = self.self_arc();
        self.run_connection_callback(&guard);
        let close = self.callbacks.lock().unwrap().close.clone();
        if let Some(close) = close {
            close(&guard);
        }
    }

    fn handle_error(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        match self.socket.take_error() {
            Ok(Some(err)) => error!(
                "TcpConnection::handle_error [{}] - SO_ERROR = {}",
                self.name, err
            ),
            Ok(None) => {}
            Err(err) => error!("TcpConnection::handle_error [{}]: {}", self.name, err),
        }
    }

    fn send_in_loop(&self, lp: &EventLoop, data: &[u8]) {
        lp.assert_in_loop_thread();
        if self.state() == State::Disconnected {
            warn!("disconnected, give up writing");
            return;
        }
        let channel = match lp.channel_for(self.fd()) {
            Some(channel) => channel,
            None => {
                warn!("connection [{}] has no channel, give up writing", self.name);
                return;
            }
        };

        let mut nwrote = 0usize;
        let mut remaining = data.len();
        let mut fault = false;
        let mut output = self.output_buffer.lock().unwrap();

        // Nothing queued and no write interest: try the socket directly.
        // With bytes already queued a direct write would reorder the
        // stream.
        if !channel.is_writing() && output.readable_bytes() == 0 {
            match self.socket.write(data) {
                Ok(n) => {
                    nwrote = n;
                    remaining = data.len() - n;
                    if remaining == 0 {
                        let cb = self.callbacks.lock().unwrap().write_complete.clone();
                        if let Some(cb) = cb {
                            let conn = self.self_arc();
                            lp.queue_in_loop(move |_| cb(&conn));
                        }
                    }
                }
                Err(err) => {
                    if err.kind() != io::ErrorKind::WouldBlock {
                        error!("TcpConnection::send_in_loop [{}]: {}", self.name, err);
                        if matches!(err.raw_os_error(), Some(libc::EPIPE) | Some(libc::ECONNRESET))
                        {
                            fault = true;
                        }
                    }
                }
            }
        }

        assert!(remaining <= data.len());
        if !fault && remaining > 0 {
            let old_len = output.readable_bytes();
            let high_water_mark = self.high_water_mark.load(Ordering::Relaxed);
            // Edge-triggered: only the crossing fires, not every send
            // above the mark.
            if old_len + remaining >= high_water_mark && old_len < high_water_mark {
                let cb = self.callbacks.lock().unwrap().high_water_mark.clone();
                if let Some(cb) = cb {
                    let conn = self.self_arc();
                    let queued = old_len + remaining;
                    lp.queue_in_loop(move |_| cb(&conn, queued));
                }
            }
            output.append(&data[nwrote..]);
            if !channel.is_writing() {
                channel.enable_writing();
            }
        }
    }

    fn shutdown_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let still_writing = lp
            .channel_for(self.fd())
            .map_or(false, |channel| channel.is_writing());
        if !still_writing {
            if let Err(err) = self.socket.shutdown_write() {
                error!("TcpConnection::shutdown_in_loop [{}]: {}", self.name, err);
            }
        }
        // Otherwise handle_write completes the shutdown once the output
        // buffer drains.
    }

    fn force_close_in_loop(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        let state = self.state();
        if state == State::Connected || state == State::Disconnecting {
            self.handle_close(lp);
        }
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        debug!(
            "TcpConnection::drop [{}] fd = {} state = {:?}",
            self.name,
            self.socket.fd(),
            self.state()
        );
        debug_assert_eq!(self.state(), State::Disconnected);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("name", &self.name)
            .field("fd", &self.socket.fd())
            .field("state", &self.state())
            .finish()
    }
}
