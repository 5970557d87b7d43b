use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{info, warn};

use crate::acceptor::Acceptor;
use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;
use crate::thread_pool::{EventLoopThreadPool, ThreadInitCallback};

/// TCP server: an acceptor on the base loop, a worker-loop pool and the
/// name → connection map.
///
/// Lives on (and must be driven from) the thread of the loop that
/// constructed it. Each accepted connection is named
/// `<serverName>-<ip:port>#<counter>`, affinitized to a worker loop for
/// life and tracked in the map; erasing the map entry on close is the
/// authoritative release.
pub struct TcpServer {
    core: Arc<ServerCore>,
    acceptor: Rc<Acceptor>,
    local_addr: SocketAddr,
}

struct ServerCore {
    base: LoopHandle,
    name: String,
    ip_port: String,
    pool: EventLoopThreadPool,
    connections: Mutex<HashMap<String, Arc<TcpConnection>>>,
    next_conn_id: AtomicU64,
    started: AtomicBool,
    connection_callback: Mutex<Option<Arc<ConnectionCallback>>>,
    message_callback: Mutex<Option<Arc<MessageCallback>>>,
    write_complete_callback: Mutex<Option<Arc<WriteCompleteCallback>>>,
    thread_init_callback: Mutex<Option<ThreadInitCallback>>,
}

impl TcpServer {
    pub fn new(
        lp: &EventLoop,
        listen_addr: &SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> io::Result<TcpServer> {
        lp.assert_in_loop_thread();
        let acceptor = Acceptor::new(lp, listen_addr, reuse_port)?;
        let local_addr = acceptor.local_addr()?;

        let core = Arc::new(ServerCore {
            base: lp.handle(),
            name: name.to_string(),
            ip_port: local_addr.to_string(),
            pool: EventLoopThreadPool::new(lp.handle(), name),
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
            thread_init_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        acceptor.set_new_connection_callback(move |socket, peer_addr| {
            if let Some(core) = weak.upgrade() {
                ServerCore::new_connection(&core, socket, peer_addr);
            }
        });

        Ok(TcpServer {
            core,
            acceptor,
            local_addr,
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// The bound listen address; differs from the requested one when
    /// binding port 0.
    pub fn local_addr(&self) -> &SocketAddr {
        &self.local_addr
    }

    /// Number of worker loops to spread connections over; zero serves
    /// everything from the base loop. Call before
    /// [`start`](TcpServer::start).
    pub fn set_thread_num(&self, num_threads: usize) {
        self.core.pool.set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(&self, cb: impl Fn(&EventLoop) + Send + Sync + 'static) {
        *self.core.thread_init_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.core.connection_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, std::time::Instant) + Send + Sync + 'static,
    ) {
        *self.core.message_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.core.write_complete_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    /// Starts the worker pool and begins listening. Idempotent.
    pub fn start(&self, lp: &EventLoop) -> io::Result<()> {
        if !self.core.started.swap(true, Ordering::AcqRel) {
            lp.assert_in_loop_thread();
            self.core
                .pool
                .start(self.core.thread_init_callback.lock().unwrap().clone());
            assert!(!self.acceptor.listening());
            self.acceptor.listen(lp)?;
            info!(
                "TcpServer [{}] listening on {}",
                self.core.name, self.local_addr
            );
        }
        Ok(())
    }

    pub fn num_connections(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<Arc<TcpConnection>> = self
            .core
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let lp = conn.loop_handle().clone();
            lp.run_in_loop(move |lp| conn.connect_destroyed(lp));
        }
    }
}

impl ServerCore {
    /// Runs on the base loop for every accepted socket: pick a worker
    /// loop, wire the connection up and hand it over for establishment.
    fn new_connection(core: &Arc<ServerCore>, socket: Socket, peer_addr: SocketAddr) {
        let io_loop = core.pool.get_next_loop();
        let conn_id = core.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}-{}#{}", core.name, core.ip_port, conn_id);
        info!(
            "TcpServer::new_connection [{}] - new connection [{}] from {}",
            core.name, conn_name, peer_addr
        );

        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("TcpServer::new_connection: getsockname: {}", err);
                peer_addr
            }
        };

        let conn = TcpConnection::new(io_loop.clone(), conn_name.clone(), socket, local_addr, peer_addr);
        conn.set_connection_callback_shared(core.connection_callback.lock().unwrap().clone());
        conn.set_message_callback_shared(core.message_callback.lock().unwrap().clone());
        conn.set_write_complete_callback_shared(
            core.write_complete_callback.lock().unwrap().clone(),
        );

        let weak: Weak<ServerCore> = Arc::downgrade(core);
        conn.set_close_callback(move |conn| {
            if let Some(core) = weak.upgrade() {
                ServerCore::remove_connection(&core, conn);
            }
        });

        core.connections
            .lock()
            .unwrap()
            .insert(conn_name, Arc::clone(&conn));
        io_loop.run_in_loop(move |lp| conn.connect_established(lp));
    }

    /// Entered from a worker loop when a connection closes; the map is
    /// owned by the base loop, so the erase is marshalled there, and the
    /// teardown goes back to the worker loop afterwards so the connection
    /// lives long enough to deliver its down-callback.
    fn remove_connection(core: &Arc<ServerCore>, conn: &Arc<TcpConnection>) {
        let core_for_loop = Arc::clone(core);
        let conn = Arc::clone(conn);
        core.base.run_in_loop(move |lp| {
            ServerCore::remove_connection_in_loop(&core_for_loop, lp, conn);
        });
    }

    fn remove_connection_in_loop(core: &Arc<ServerCore>, lp: &EventLoop, conn: Arc<TcpConnection>) {
        lp.assert_in_loop_thread();
        info!(
            "TcpServer::remove_connection_in_loop [{}] - connection {}",
            core.name,
            conn.name()
        );
        let removed = core.connections.lock().unwrap().remove(conn.name());
        debug_assert!(removed.is_some());
        let io_loop = conn.loop_handle().clone();
        io_loop.queue_in_loop(move |lp| conn.connect_destroyed(lp));
    }
}
