use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use log::{info, warn};

use crate::buffer::Buffer;
use crate::connection::{
    ConnectionCallback, MessageCallback, TcpConnection, WriteCompleteCallback,
};
use crate::connector::Connector;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sys::Socket;

/// TCP client: a connector plus at most one live connection.
///
/// With retry enabled the client reconnects (with a fresh back-off)
/// whenever an established connection goes down. `disconnect` half-closes
/// the write side of the current connection; `stop` cancels an in-flight
/// connect attempt.
pub struct TcpClient {
    core: Arc<ClientCore>,
}

struct ClientCore {
    loop_handle: LoopHandle,
    connector: Arc<Connector>,
    name: String,
    retry: AtomicBool,
    connect: AtomicBool,
    next_conn_id: AtomicU64,
    connection: Mutex<Option<Arc<TcpConnection>>>,
    connection_callback: Mutex<Option<Arc<ConnectionCallback>>>,
    message_callback: Mutex<Option<Arc<MessageCallback>>>,
    write_complete_callback: Mutex<Option<Arc<WriteCompleteCallback>>>,
}

impl TcpClient {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr, name: &str) -> TcpClient {
        let connector = Connector::new(loop_handle.clone(), server_addr);
        let core = Arc::new(ClientCore {
            loop_handle,
            connector,
            name: name.to_string(),
            retry: AtomicBool::new(false),
            connect: AtomicBool::new(true),
            next_conn_id: AtomicU64::new(1),
            connection: Mutex::new(None),
            connection_callback: Mutex::new(None),
            message_callback: Mutex::new(None),
            write_complete_callback: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        core.connector
            .set_new_connection_callback(move |lp, socket| {
                if let Some(core) = weak.upgrade() {
                    ClientCore::new_connection(&core, lp, socket);
                }
            });

        TcpClient { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn server_address(&self) -> &SocketAddr {
        self.core.connector.server_address()
    }

    /// The live connection, if established.
    pub fn connection(&self) -> Option<Arc<TcpConnection>> {
        self.core.connection.lock().unwrap().clone()
    }

    pub fn retry_on_close(&self) -> bool {
        self.core.retry.load(Ordering::Acquire)
    }

    /// Reconnect whenever an established connection goes down.
    pub fn enable_retry(&self) {
        self.core.retry.store(true, Ordering::Release);
    }

    pub fn connect(&self) {
        info!(
            "TcpClient::connect [{}] - connecting to {}",
            self.core.name,
            self.core.connector.server_address()
        );
        self.core.connect.store(true, Ordering::Release);
        self.core.connector.start();
    }

    /// Half-closes the current connection's write side; buffered bytes are
    /// delivered before the FIN.
    pub fn disconnect(&self) {
        self.core.connect.store(false, Ordering::Release);
        if let Some(conn) = self.core.connection.lock().unwrap().clone() {
            conn.shutdown();
        }
    }

    /// Cancels an in-flight connect attempt.
    pub fn stop(&self) {
        self.core.connect.store(false, Ordering::Release);
        self.core.connector.stop();
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.core.connection_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        *self.core.message_callback.lock().unwrap() = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&Arc<TcpConnection>) + Send + Sync + 'static,
    ) {
        *self.core.write_complete_callback.lock().unwrap() = Some(Arc::new(cb));
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        info!("TcpClient::drop [{}]", self.core.name);
        let conn = self.core.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            // The client is going away but the connection may outlive it:
            // detach the close path from the client and let the loop
            // finish the teardown on its own.
            let lp = self.core.loop_handle.clone();
            conn.set_close_callback(move |conn| {
                let conn = Arc::clone(conn);
                lp.queue_in_loop(move |lp| conn.connect_destroyed(lp));
            });
            // Slot + this clone: nobody else holds the connection, so
            // nobody else can ever close it.
            if Arc::strong_count(&conn) <= 2 {
                conn.force_close();
            }
        } else {
            self.core.connector.stop();
        }
    }
}

impl ClientCore {
    /// Runs on the client's loop with the freshly connected socket.
    fn new_connection(core: &Arc<ClientCore>, lp: &EventLoop, socket: Socket) {
        lp.assert_in_loop_thread();
        let peer_addr = match socket.peer_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("TcpClient::new_connection: getpeername: {}", err);
                *core.connector.server_address()
            }
        };
        let local_addr = match socket.local_addr() {
            Ok(addr) => addr,
            Err(err) => {
                warn!("TcpClient::new_connection: getsockname: {}", err);
                peer_addr
            }
        };
        let conn_id = core.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn_name = format!("{}:{}#{}", core.name, peer_addr, conn_id);

        let conn = TcpConnection::new(
            core.loop_handle.clone(),
            conn_name,
            socket,
            local_addr,
            peer_addr,
        );
        conn.set_connection_callback_shared(core.connection_callback.lock().unwrap().clone());
        conn.set_message_callback_shared(core.message_callback.lock().unwrap().clone());
        conn.set_write_complete_callback_shared(
            core.write_complete_callback.lock().unwrap().clone(),
        );

        let weak: Weak<ClientCore> = Arc::downgrade(core);
        conn.set_close_callback(move |conn| {
            if let Some(core) = weak.upgrade() {
                ClientCore::remove_connection(&core, conn);
            }
        });

        *core.connection.lock().unwrap() = Some(Arc::clone(&conn));
        conn.connect_established(lp);
    }

    /// Runs on the loop when the connection closes; clears the slot and
    /// reconnects when retry is enabled.
    fn remove_connection(core: &Arc<ClientCore>, conn: &Arc<TcpConnection>) {
        {
            let mut slot = core.connection.lock().unwrap();
            debug_assert!(slot
                .as_ref()
                .map_or(false, |held| Arc::ptr_eq(held, conn)));
            *slot = None;
        }
        let conn = Arc::clone(conn);
        core.loop_handle
            .queue_in_loop(move |lp| conn.connect_destroyed(lp));

        if core.retry.load(Ordering::Acquire) && core.connect.load(Ordering::Acquire) {
            info!(
                "TcpClient::remove_connection [{}] - reconnecting to {}",
                core.name,
                core.connector.server_address()
            );
            core.connector.restart();
        }
    }
}
