use std::io;
use std::mem::{self, size_of};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use super::net::{get_local_addr, get_peer_addr, socket_addr, to_socket_addr};

/// An owned, non-blocking TCP socket.
///
/// The descriptor is closed on drop; nothing else in the runtime closes
/// socket descriptors, which makes leaks easy to spot.
#[derive(Debug)]
pub(crate) struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking, close-on-exec stream socket for the address
    /// family of `addr`.
    pub(crate) fn new_nonblocking(addr: &SocketAddr) -> io::Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        let fd = syscall!(socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        ))?;
        // SAFETY: `socket(2)` returned a valid, unowned descriptor.
        Ok(Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub(crate) fn bind(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_addr_length) = socket_addr(addr);
        syscall!(bind(self.fd(), raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
    }

    pub(crate) fn listen(&self) -> io::Result<()> {
        syscall!(listen(self.fd(), libc::SOMAXCONN)).map(|_| ())
    }

    /// Accepts one pending connection. The returned socket is non-blocking
    /// and close-on-exec from the start via `accept4(2)`.
    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = syscall!(accept4(
            self.fd(),
            &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        // SAFETY: `accept4(2)` returned a valid, unowned descriptor.
        let socket = Socket {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        };
        let addr = to_socket_addr(&storage)?;
        Ok((socket, addr))
    }

    /// Starts a non-blocking connect. An in-progress connect surfaces as
    /// `EINPROGRESS`; completion is reported through write readiness.
    pub(crate) fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw_addr, raw_addr_length) = socket_addr(addr);
        syscall!(connect(self.fd(), raw_addr.as_ptr(), raw_addr_length)).map(|_| ())
    }

    /// Half-closes the write side, after which the peer reads EOF once it
    /// has drained everything sent before this call.
    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd(), libc::SHUT_WR)).map(|_| ())
    }

    pub(crate) fn write(&self, buf: &[u8]) -> io::Result<usize> {
        syscall!(write(
            self.fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        ))
        .map(|n| n as usize)
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.set_bool_option(libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    fn set_bool_option(&self, level: libc::c_int, name: libc::c_int, on: bool) -> io::Result<()> {
        let optval: libc::c_int = on as libc::c_int;
        syscall!(setsockopt(
            self.fd(),
            level,
            name,
            &optval as *const libc::c_int as *const libc::c_void,
            size_of::<libc::c_int>() as libc::socklen_t,
        ))
        .map(|_| ())
    }

    /// Pending error on the socket (`SO_ERROR`), cleared by the read.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut optval: libc::c_int = 0;
        let mut len = size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut optval as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        ))?;
        if optval == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(optval)))
        }
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddr> {
        get_local_addr(self.fd())
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddr> {
        get_peer_addr(self.fd())
    }

    /// True when local and peer endpoints are identical: the kernel looped
    /// the SYN back because the chosen ephemeral port equals the target
    /// port on a local address.
    pub(crate) fn is_self_connect(&self) -> bool {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => local.ip() == peer.ip() && local.port() == peer.port(),
            _ => false,
        }
    }

    pub(crate) fn tcp_info(&self) -> io::Result<libc::tcp_info> {
        let mut info: libc::tcp_info = unsafe { mem::zeroed() };
        let mut len = size_of::<libc::tcp_info>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd(),
            libc::IPPROTO_TCP,
            libc::TCP_INFO,
            &mut info as *mut libc::tcp_info as *mut libc::c_void,
            &mut len,
        ))?;
        Ok(info)
    }

    /// Kernel TCP diagnostics as a single formatted line.
    pub(crate) fn tcp_info_string(&self) -> io::Result<String> {
        let info = self.tcp_info()?;
        Ok(format!(
            "unrecovered={} rto={} ato={} snd_mss={} rcv_mss={} \
             lost={} retrans={} rtt={} rttvar={} \
             sshthresh={} cwnd={} total_retrans={}",
            info.tcpi_retransmits,
            info.tcpi_rto,
            info.tcpi_ato,
            info.tcpi_snd_mss,
            info.tcpi_rcv_mss,
            info.tcpi_lost,
            info.tcpi_retrans,
            info.tcpi_rtt,
            info.tcpi_rttvar,
            info.tcpi_snd_ssthresh,
            info.tcpi_snd_cwnd,
            info.tcpi_total_retrans,
        ))
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
