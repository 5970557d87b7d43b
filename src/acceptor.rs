use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use std::ptr;
use std::rc::Rc;

use log::error;

use crate::channel::Channel;
use crate::event_loop::EventLoop;
use crate::sys::{self, Socket};

pub type NewConnectionCallback = Box<dyn FnMut(Socket, SocketAddr)>;

/// Accepts connections on a bound, listening socket and hands each new
/// descriptor with its peer address to the registered callback.
///
/// Loop-local: lives on the loop that polls the listen socket.
///
/// One sentinel descriptor (`/dev/null`) is reserved at construction.
/// When `accept` fails with `EMFILE`, the sentinel is closed, the pending
/// connection is accepted into the freed slot and immediately closed, and
/// the sentinel is re-opened. Without this the listen socket would stay
/// readable forever, spinning the loop on a connection it can never admit.
pub struct Acceptor {
    socket: Socket,
    channel: Rc<Channel>,
    idle_fd: RefCell<Option<OwnedFd>>,
    listening: Cell<bool>,
    new_connection_callback: RefCell<Option<NewConnectionCallback>>,
}

impl Acceptor {
    pub fn new(
        lp: &EventLoop,
        listen_addr: &SocketAddr,
        reuse_port: bool,
    ) -> io::Result<Rc<Acceptor>> {
        lp.assert_in_loop_thread();
        let socket = Socket::new_nonblocking(listen_addr)?;
        socket.set_reuse_addr(true)?;
        socket.set_reuse_port(reuse_port)?;
        socket.bind(listen_addr)?;

        let idle_fd = sys::open_idle_fd()?;
        let channel = Channel::new(lp, socket.fd());

        let acceptor = Rc::new(Acceptor {
            socket,
            channel,
            idle_fd: RefCell::new(Some(idle_fd)),
            listening: Cell::new(false),
            new_connection_callback: RefCell::new(None),
        });

        let weak = Rc::downgrade(&acceptor);
        acceptor.channel.set_read_callback(move |lp, _| {
            if let Some(acceptor) = weak.upgrade() {
                acceptor.handle_read(lp);
            }
        });

        Ok(acceptor)
    }

    pub fn set_new_connection_callback(&self, cb: impl FnMut(Socket, SocketAddr) + 'static) {
        *self.new_connection_callback.borrow_mut() = Some(Box::new(cb));
    }

    pub fn listening(&self) -> bool {
        self.listening.get()
    }

    /// The address actually bound, which differs from the requested one
    /// when binding port 0.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn listen(&self, lp: &EventLoop) -> io::Result<()> {
        lp.assert_in_loop_thread();
        self.listening.set(true);
        self.socket.listen()?;
        self.channel.enable_reading();
        Ok(())
    }

    /// One accept per readiness notification: under level-triggered
    /// polling the kernel re-reports a non-empty accept queue, and taking
    /// a single connection per pass keeps dispatch fair.
    fn handle_read(&self, lp: &EventLoop) {
        lp.assert_in_loop_thread();
        match self.socket.accept() {
            Ok((socket, peer_addr)) => {
                if let Some(cb) = self.new_connection_callback.borrow_mut().as_mut() {
                    cb(socket, peer_addr);
                } else {
                    drop(socket);
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                error!("in Acceptor::handle_read: {}", err);
                if err.raw_os_error() == Some(libc::EMFILE) {
                    let mut idle = self.idle_fd.borrow_mut();
                    idle.take();
                    if let Ok(fd) = syscall!(accept(self.socket.fd(), ptr::null_mut(), ptr::null_mut())) {
                        let _ = syscall!(close(fd));
                    }
                    *idle = sys::open_idle_fd().ok();
                }
            }
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.channel.disable_all();
        self.channel.remove();
    }
}
