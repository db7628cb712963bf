//! TCP socket wrappers for mio-based I/O.
//!
//! Thin wrappers around [`mio::net::TcpListener`] and [`mio::net::TcpStream`]
//! that speak [`Endpoint`] and apply the socket options sensors need.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::time::Duration;

use mio::event::Source;
use mio::net::{TcpListener as MioTcpListener, TcpStream as MioTcpStream};
use mio::{Interest, Registry, Token};

use super::Endpoint;

/// A non-blocking listening socket.
pub struct TcpListener {
    inner: MioTcpListener,
}

impl TcpListener {
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g. already in use).
    pub fn bind(endpoint: Endpoint) -> io::Result<Self> {
        let inner = MioTcpListener::bind(endpoint.into())?;
        Ok(Self { inner })
    }

    /// # Errors
    ///
    /// Returns an error if the local address cannot be retrieved.
    pub fn local_addr(&self) -> io::Result<Endpoint> {
        self.inner.local_addr().map(Endpoint::from)
    }

    /// Accepts one pending connection, returning `Ok(None)` instead of
    /// `WouldBlock`.
    ///
    /// # Errors
    ///
    /// Returns any accept error other than `WouldBlock`.
    pub fn try_accept(&self) -> io::Result<Option<(TcpStream, Endpoint)>> {
        match self.inner.accept() {
            Ok((stream, addr)) => Ok(Some((TcpStream { inner: stream }, Endpoint::from(addr)))),
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Source for TcpListener {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}

/// A non-blocking accepted connection.
pub struct TcpStream {
    inner: MioTcpStream,
}

impl TcpStream {
    /// Disables Nagle and, when `keepalive` is set, enables TCP keepalive
    /// probes after that much idle time.
    ///
    /// # Errors
    ///
    /// Returns an error if an option cannot be set.
    pub fn configure(&self, keepalive: Option<Duration>) -> io::Result<()> {
        self.inner.set_nodelay(true)?;
        // mio doesn't expose keepalive; go through rustix.
        let fd = self.inner.as_fd();
        match keepalive {
            Some(idle) => {
                rustix::net::sockopt::set_socket_keepalive(fd, true)?;
                rustix::net::sockopt::set_tcp_keepidle(fd, idle)?;
            }
            None => rustix::net::sockopt::set_socket_keepalive(fd, false)?,
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the peer address cannot be retrieved.
    pub fn peer_addr(&self) -> io::Result<Endpoint> {
        self.inner.peer_addr().map(Endpoint::from)
    }

    /// # Errors
    ///
    /// Returns an error if the keepalive option cannot be read.
    pub fn keepalive(&self) -> io::Result<bool> {
        Ok(rustix::net::sockopt::socket_keepalive(self.inner.as_fd())?)
    }

    /// Half-closes both directions; errors on already-closed sockets are ignored.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(std::net::Shutdown::Both);
    }
}

impl Read for TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl AsFd for TcpStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl Source for TcpStream {
    fn register(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.register(registry, token, interests)
    }

    fn reregister(
        &mut self,
        registry: &Registry,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.inner.reregister(registry, token, interests)
    }

    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        self.inner.deregister(registry)
    }
}
