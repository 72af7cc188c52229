// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Non-blocking TCP client sockets.
//!
//! A `TcpStream` owns its descriptor and its reactor attachment. The
//! socket is attached (with no interest armed) as soon as it is created,
//! read and write arm it one-shot when the kernel says `EAGAIN`, and
//! dropping the stream deregisters and closes it.

use std::fmt;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use crate::context::Handle;
use crate::error::{Failure, Outcome};
use crate::runtime::io::{retry_on_ready, sys_read, sys_write};
use crate::runtime::reactor::{Interest, Reactor};
use crate::unit::Unit;

/// Connected, non-blocking TCP socket.
pub struct TcpStream {
    fd: RawFd,
    reactor: Rc<Reactor>,
    peer: SocketAddrV4,
}

impl TcpStream {
    /// Read into `buf`. `Ok(0)` means the peer shut down its side.
    pub async fn read(&self, buf: &mut [u8]) -> Outcome<usize> {
        let fd = self.fd;
        retry_on_ready(&self.reactor, fd, Interest::Readable, || sys_read(fd, buf)).await
    }

    /// Write from `buf`; may write fewer bytes than `buf.len()`.
    pub async fn write(&self, buf: &[u8]) -> Outcome<usize> {
        let fd = self.fd;
        retry_on_ready(&self.reactor, fd, Interest::Writable, || sys_write(fd, buf)).await
    }

    /// Write the whole buffer.
    pub async fn write_all(&self, mut buf: &[u8]) -> Outcome<()> {
        while !buf.is_empty() {
            match self.write(buf).await? {
                0 => {
                    return Err(Failure::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted zero bytes",
                    )))
                }
                n => buf = &buf[n..],
            }
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddrV4 {
        self.peer
    }
}

impl AsRawFd for TcpStream {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        if let Err(e) = self.reactor.deregister(self.fd) {
            tracing::warn!(fd = self.fd, error = %e, "deregister on close failed");
        }
        unsafe {
            libc::close(self.fd);
        }
        tracing::debug!(fd = self.fd, peer = %self.peer, "tcp stream closed");
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("fd", &self.fd)
            .field("peer", &self.peer)
            .finish()
    }
}

impl Handle {
    /// Connect to `ip:port`, where `ip` is a dotted IPv4 literal.
    ///
    /// Fails with `InvalidAddress` for a malformed literal and `Connect`
    /// when the peer refuses or the connection otherwise fails.
    pub fn create_tcp_client(&self, ip: &str, port: u16) -> Unit<TcpStream> {
        let reactor = self.reactor().clone();
        let ip = ip.to_owned();
        Unit::new(async move {
            let addr: Ipv4Addr = ip.parse().map_err(|_| Failure::InvalidAddress(ip))?;
            connect(reactor, SocketAddrV4::new(addr, port)).await
        })
    }
}

async fn connect(reactor: Rc<Reactor>, addr: SocketAddrV4) -> Outcome<TcpStream> {
    let fd = unsafe {
        libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Failure::Io(io::Error::last_os_error()));
    }

    // Owned from here on; any early return closes the socket.
    let socket = Socket { fd };
    reactor.attach(fd)?;
    let stream = TcpStream {
        fd: socket.into_raw(),
        reactor,
        peer: addr,
    };

    let sockaddr = to_sockaddr(addr);
    let ret = unsafe {
        libc::connect(
            fd,
            &sockaddr as *const libc::sockaddr_in as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if ret == 0 {
        tracing::debug!(fd, %addr, "connected");
        return Ok(stream);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EINPROGRESS) | Some(libc::EINTR) => {}
        _ => return Err(Failure::Connect { addr, source: err }),
    }

    loop {
        let readiness = stream.reactor.writable(fd).await?;
        match socket_error(fd) {
            // Hung up with no pending error: the peer went away mid-handshake.
            Ok(0) if readiness.is_error() || readiness.is_hangup() => {
                return Err(Failure::Connect {
                    addr,
                    source: io::ErrorKind::ConnectionAborted.into(),
                })
            }
            Ok(0) => {
                tracing::debug!(fd, %addr, "connected");
                return Ok(stream);
            }
            Ok(libc::EINPROGRESS) | Ok(libc::EALREADY) => continue,
            Ok(code) => {
                return Err(Failure::Connect {
                    addr,
                    source: io::Error::from_raw_os_error(code),
                })
            }
            Err(source) => return Err(Failure::Connect { addr, source }),
        }
    }
}

/// Bare descriptor closed on drop; covers the window before the stream
/// (and its reactor attachment) exists.
struct Socket {
    fd: RawFd,
}

impl Socket {
    fn into_raw(self) -> RawFd {
        let fd = self.fd;
        mem::forget(self);
        fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

fn to_sockaddr(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut sin: libc::sockaddr_in = unsafe { mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr = libc::in_addr {
        s_addr: u32::from(*addr.ip()).to_be(),
    };
    sin
}

/// Pending error on the socket (`SO_ERROR`), 0 if none.
fn socket_error(fd: RawFd) -> io::Result<i32> {
    let mut code: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sockaddr_is_network_order() {
        let sin = to_sockaddr(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080));
        assert_eq!(sin.sin_family as i32, libc::AF_INET);
        assert_eq!(u16::from_be(sin.sin_port), 8080);
        assert_eq!(u32::from_be(sin.sin_addr.s_addr), 0x7f00_0001);
    }

    #[test]
    fn malformed_address_fails() {
        let rt = crate::Runtime::new().unwrap();
        for bad in ["", "localhost", "1.2.3", "256.0.0.1", "::1"] {
            match rt.block_on(rt.handle().create_tcp_client(bad, 80)) {
                Err(Failure::InvalidAddress(s)) => assert_eq!(s, bad),
                other => panic!("{bad:?}: expected InvalidAddress, got {:?}", other),
            }
        }
    }
}
