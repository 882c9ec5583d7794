use crate::server::connection::Session;

use libc::{ c_int, c_void, sockaddr, sockaddr_in, socklen_t };
use std::io;
use std::mem;
use std::net::{ Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs };
use std::os::unix::io::{ AsRawFd, FromRawFd, OwnedFd, RawFd };
use thiserror::Error;

/// Pending-connection queue length handed to `listen(2)`.
pub const LISTEN_BACKLOG: c_int = 10;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("cannot resolve {address}:{port}: {reason}")]
    Resolve {
        address: String,
        port: u16,
        reason: String,
    },
    #[error("{op} on {addr} failed: {reason}")]
    Os {
        op: &'static str,
        addr: SocketAddr,
        reason: String,
    },
    #[error("cannot watch {addr}: {source}")]
    Register {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A bound, non-blocking IPv4 stream socket that is not listening yet.
pub struct BoundSocket {
    fd: OwnedFd,
    addr: SocketAddr,
}

/// A passive socket accepting sessions.
pub struct Listener {
    inner: mio::net::TcpListener,
    addr: SocketAddr,
}

/// Resolves `address`, creates a non-blocking socket and binds it.
pub fn bind(address: &str, port: u16) -> Result<BoundSocket, BindError> {
    let resolve_error = |reason: String| BindError::Resolve {
        address: address.to_string(),
        port,
        reason,
    };
    let v4 = (address, port)
        .to_socket_addrs()
        .map_err(|e| resolve_error(e.to_string()))?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
        .ok_or_else(|| resolve_error("no IPv4 address".to_string()))?;
    let addr = SocketAddr::V4(v4);

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(os_error("socket", addr));
    }
    // Owned from here on, so every early return closes it.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let raw = fd.as_raw_fd();

    set_flag(raw, libc::F_GETFL, libc::F_SETFL, libc::O_NONBLOCK).map_err(|_| os_error("fcntl", addr))?;
    set_flag(raw, libc::F_GETFD, libc::F_SETFD, libc::FD_CLOEXEC).map_err(|_| os_error("fcntl", addr))?;

    let one: c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const c_int as *const c_void,
            mem::size_of::<c_int>() as socklen_t
        )
    };
    if res < 0 {
        return Err(os_error("setsockopt", addr));
    }

    let sin = to_sockaddr_in(&v4);
    let res = unsafe {
        libc::bind(
            raw,
            &sin as *const sockaddr_in as *const sockaddr,
            mem::size_of::<sockaddr_in>() as socklen_t
        )
    };
    if res < 0 {
        return Err(os_error("bind", addr));
    }

    Ok(BoundSocket { fd, addr: local_addr(raw).unwrap_or(addr) })
}

impl BoundSocket {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Marks the socket passive with [`LISTEN_BACKLOG`].
    pub fn listen(self) -> Result<Listener, BindError> {
        let res = unsafe { libc::listen(self.fd.as_raw_fd(), LISTEN_BACKLOG) };
        if res < 0 {
            return Err(os_error("listen", self.addr));
        }
        let std_listener = std::net::TcpListener::from(self.fd);
        Ok(Listener {
            inner: mio::net::TcpListener::from_std(std_listener),
            addr: self.addr,
        })
    }
}

impl Listener {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }

    /// `Ok(None)` when no connection is pending; retry on the next
    /// readiness notification.
    pub fn accept(&self) -> io::Result<Option<Session>> {
        match self.inner.accept() {
            Ok((stream, peer)) => Ok(Some(Session::new(stream, peer, self.addr))),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn set_flag(fd: RawFd, get: c_int, set: c_int, flag: c_int) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, get) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, set, flags | flag) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn to_sockaddr_in(addr: &SocketAddrV4) -> sockaddr_in {
    let mut sin: sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
    sin
}

/// Address actually bound, which differs from the request for port 0.
fn local_addr(fd: RawFd) -> Option<SocketAddr> {
    let mut sin: sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_in>() as socklen_t;
    let res = unsafe { libc::getsockname(fd, &mut sin as *mut sockaddr_in as *mut sockaddr, &mut len) };
    if res < 0 {
        return None;
    }
    let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
    Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
}

fn os_error(op: &'static str, addr: SocketAddr) -> BindError {
    BindError::Os {
        op,
        addr,
        reason: io::Error::last_os_error().to_string(),
    }
}
