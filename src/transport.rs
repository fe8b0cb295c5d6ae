/*
 * This file is a part of resp-client.
 *
 * resp-client is free software: you can redistribute it and/or modify
 * it under the terms of the Apache License, Version 2.0.
*/

//! # Transport collaborator
//!
//! The core protocol engine never opens a socket itself; it is handed a
//! [`Transport`] (§6's "transport collaborator", opaque to the core). This
//! mirrors the store's own split between `RawListener`/`BufferedSocketStream`
//! (connection plumbing) and the protocol state machine that only ever sees
//! `&mut dyn Read`/`&mut dyn Write`-like access.
//!
//! Two blocking implementations are provided: [`TcpTransport`] and, on Unix,
//! [`UnixTransport`]. The async driver (§4.6) uses `tokio`'s own streams
//! directly rather than this trait, since it needs readiness-driven
//! non-blocking I/O, not the blocking read/write this trait models.

use crate::config::{ConnectOptions, Endpoint};
use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

/// A connected, blocking, byte-oriented transport.
pub trait Transport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()>;
    fn shutdown(&mut self);
}

/// Connect per [`ConnectOptions`], returning a boxed [`Transport`].
pub fn connect(options: &ConnectOptions) -> Result<Box<dyn Transport + Send>> {
    match &options.endpoint {
        Endpoint::Tcp {
            ip,
            port,
            source_addr,
        } => Ok(Box::new(TcpTransport::connect(
            ip,
            *port,
            source_addr.as_deref(),
            options,
        )?)),
        #[cfg(unix)]
        Endpoint::Unix { path } => Ok(Box::new(UnixTransport::connect(path, options)?)),
        #[cfg(not(unix))]
        Endpoint::Unix { .. } => Err(Error::other("unix sockets are not supported on this platform")),
        Endpoint::Fd(_) => Err(Error::other(
            "adopting a raw descriptor is not yet implemented for the blocking transport",
        )),
    }
}

/// A blocking TCP transport (§6: `connect_tcp`).
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(
        ip: &str,
        port: u16,
        source_addr: Option<&str>,
        options: &ConnectOptions,
    ) -> Result<Self> {
        use std::net::ToSocketAddrs;
        let addr = (ip, port)
            .to_socket_addrs()
            .map_err(Error::from)?
            .next()
            .ok_or_else(|| Error::other(format!("no address found for {ip}:{port}")))?;
        let stream = if let Some(src) = source_addr {
            connect_from(src, addr, options.reuseaddr, options.connect_timeout)?
        } else if let Some(timeout) = options.connect_timeout {
            TcpStream::connect_timeout(&addr, timeout).map_err(Error::from)?
        } else {
            TcpStream::connect(addr).map_err(Error::from)?
        };
        stream.set_nodelay(true).map_err(Error::from)?;
        if options.keepalive {
            set_keepalive(&stream)?;
        }
        Ok(Self { stream })
    }
}

fn connect_from(
    source_addr: &str,
    addr: std::net::SocketAddr,
    reuseaddr: bool,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    use std::net::SocketAddr;
    let bind_addr: SocketAddr = source_addr
        .parse()
        .map_err(|_| Error::other(format!("invalid source_addr {source_addr}")))?;
    let _ = timeout;
    bind_and_connect(bind_addr, addr, reuseaddr)
}

/// Bind a socket to `bind_addr` (honoring `SO_REUSEADDR`, §6's `reuseaddr`
/// option) and connect it to `addr`. `std::net::TcpStream` has no
/// bind-then-connect primitive and no portable `SO_REUSEADDR` knob, so this
/// drops to the raw socket the same way the store's own `libc`-backed OS
/// glue (`util/os.rs`) does for options std doesn't expose.
#[cfg(unix)]
fn bind_and_connect(
    bind_addr: std::net::SocketAddr,
    addr: std::net::SocketAddr,
    reuseaddr: bool,
) -> Result<TcpStream> {
    use socket_raw::{sockaddr_from, Family};
    use std::os::unix::io::{FromRawFd, RawFd};

    let family = match bind_addr {
        std::net::SocketAddr::V4(_) => Family::Inet,
        std::net::SocketAddr::V6(_) => Family::Inet6,
    };
    let fd: RawFd = unsafe {
        libc::socket(
            family.as_raw(),
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if fd < 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    if reuseaddr {
        let optval: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(Error::from(err));
        }
    }
    let (bind_sa, bind_len) = sockaddr_from(bind_addr);
    if unsafe { libc::bind(fd, bind_sa.as_ptr() as *const libc::sockaddr, bind_len) } != 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::from(err));
    }
    let (connect_sa, connect_len) = sockaddr_from(addr);
    if unsafe {
        libc::connect(
            fd,
            connect_sa.as_ptr() as *const libc::sockaddr,
            connect_len,
        )
    } != 0
    {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(Error::from(err));
    }
    Ok(unsafe { TcpStream::from_raw_fd(fd) })
}

#[cfg(not(unix))]
fn bind_and_connect(
    _bind_addr: std::net::SocketAddr,
    addr: std::net::SocketAddr,
    _reuseaddr: bool,
) -> Result<TcpStream> {
    // source-address binding with SO_REUSEADDR needs the raw-socket path
    // above; on non-Unix targets we fall back to an ordinary connect, the
    // same graceful degradation `util/os.rs`'s Unix-only helpers use there.
    TcpStream::connect(addr).map_err(Error::from)
}

/// Apply `SO_KEEPALIVE`; std exposes no portable setter for it.
#[cfg(unix)]
fn set_keepalive(stream: &TcpStream) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let optval: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_KEEPALIVE,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(Error::from(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_keepalive(_stream: &TcpStream) -> Result<()> {
    log::trace!("keepalive requested but not configurable on this platform");
    Ok(())
}

#[cfg(unix)]
mod socket_raw {
    use std::net::SocketAddr;

    pub enum Family {
        Inet,
        Inet6,
    }

    impl Family {
        pub fn as_raw(&self) -> libc::c_int {
            match self {
                Family::Inet => libc::AF_INET,
                Family::Inet6 => libc::AF_INET6,
            }
        }
    }

    /// Build a `sockaddr_storage` for `addr`, returning it alongside the
    /// length `bind`/`connect` expect.
    pub fn sockaddr_from(addr: SocketAddr) -> (SockAddrStorage, libc::socklen_t) {
        match addr {
            SocketAddr::V4(v4) => {
                let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                sa.sin_family = libc::AF_INET as libc::sa_family_t;
                sa.sin_port = v4.port().to_be();
                sa.sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
                (
                    SockAddrStorage::V4(sa),
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut sa: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                sa.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sa.sin6_port = v6.port().to_be();
                sa.sin6_addr.s6_addr = v6.ip().octets();
                (
                    SockAddrStorage::V6(sa),
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        }
    }

    pub enum SockAddrStorage {
        V4(libc::sockaddr_in),
        V6(libc::sockaddr_in6),
    }

    impl SockAddrStorage {
        pub fn as_ptr(&self) -> *const u8 {
            match self {
                SockAddrStorage::V4(sa) => sa as *const _ as *const u8,
                SockAddrStorage::V6(sa) => sa as *const _ as *const u8,
            }
        }
    }
}

impl Transport for TcpTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Error::from)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout).map_err(Error::from)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// A blocking Unix-domain-socket transport (§6: `connect_unix`).
#[cfg(unix)]
pub struct UnixTransport {
    stream: std::os::unix::net::UnixStream,
}

#[cfg(unix)]
impl UnixTransport {
    pub fn connect(path: &str, options: &ConnectOptions) -> Result<Self> {
        use std::os::unix::net::UnixStream;
        let stream = UnixStream::connect(path).map_err(Error::from)?;
        let _ = options;
        Ok(Self { stream })
    }
}

#[cfg(unix)]
impl Transport for UnixTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.stream.read(buf).map_err(Error::from)
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).map_err(Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout).map_err(Error::from)
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_write_timeout(timeout).map_err(Error::from)
    }

    fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::net::TcpListener;

    #[test]
    fn tcp_transport_connects_and_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 5];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hello");
        });
        let options = ConnectOptions::tcp(addr.ip().to_string(), addr.port());
        let mut transport = TcpTransport::connect(
            &addr.ip().to_string(),
            addr.port(),
            None,
            &options,
        )
        .unwrap();
        transport.write_all(b"hello").unwrap();
        handle.join().unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn source_addr_with_reuseaddr_binds_then_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut buf = [0u8; 2];
            sock.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"hi");
        });
        let options = ConnectOptions::tcp(addr.ip().to_string(), addr.port())
            .with_source_addr("127.0.0.1:0")
            .reuseaddr(true);
        let mut transport = TcpTransport::connect(
            &addr.ip().to_string(),
            addr.port(),
            Some("127.0.0.1:0"),
            &options,
        )
        .unwrap();
        transport.write_all(b"hi").unwrap();
        handle.join().unwrap();
    }
}
