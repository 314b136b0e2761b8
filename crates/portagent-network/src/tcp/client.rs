use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{SocketAddr, ToSocketAddrs},
};

use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::SocketError;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and the connection must be rebuilt.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// Single mio-backed non-blocking TCP endpoint carrying a raw byte stream.
///
/// Outbound:
///   - `write_data` writes what the kernel takes immediately; the unwritten
///     remainder is queued and flushed on the next writable event.
///   - WRITABLE interest is armed only while the backlog is non-empty (or
///     while an outbound connect is still pending).
///
/// Inbound:
///   - `read_data` returns 0 on no-data, >0 on success, and flips the
///     endpoint dead on EOF or a fatal errno. Callers check `is_alive`
///     after a zero read to tell the two apart.
///
/// An outbound connect is in progress until the kernel reports writable with
/// a clear SO_ERROR; `on_writable` performs that confirmation.
pub struct TcpClient {
    stream: mio::net::TcpStream,
    peer_addr: SocketAddr,
    token: Token,
    send_backlog: VecDeque<Vec<u8>>,
    /// Invariant: armed while backlog is non-empty or connect is pending.
    writable_armed: bool,
    connected: bool,
    alive: bool,
}

impl TcpClient {
    /// Resolves `host` and issues a non-blocking connect; in-progress is
    /// success. Registered for READABLE|WRITABLE so connect completion
    /// surfaces as a writable event.
    pub fn connect(
        host: &str,
        port: u16,
        registry: &Registry,
        token: Token,
    ) -> Result<Self, SocketError> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|source| SocketError::HostFailure { host: host.to_string(), source })?
            .next()
            .ok_or_else(|| SocketError::HostFailure {
                host: host.to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no address"),
            })?;

        let mut stream = mio::net::TcpStream::connect(addr)
            .map_err(|source| SocketError::ConnectFailure { addr: addr.to_string(), source })?;
        let _ = stream.set_nodelay(true);
        registry
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)
            .map_err(SocketError::CreateFailure)?;

        Ok(Self {
            stream,
            peer_addr: addr,
            token,
            send_backlog: VecDeque::with_capacity(8),
            writable_armed: true,
            connected: false,
            alive: true,
        })
    }

    /// Wraps a freshly accepted peer; already connected.
    pub fn from_accepted(
        mut stream: mio::net::TcpStream,
        peer_addr: SocketAddr,
        registry: &Registry,
        token: Token,
    ) -> io::Result<Self> {
        let _ = stream.set_nodelay(true);
        registry.register(&mut stream, token, Interest::READABLE)?;
        Ok(Self {
            stream,
            peer_addr,
            token,
            send_backlog: VecDeque::with_capacity(8),
            writable_armed: false,
            connected: true,
            alive: true,
        })
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.connected && self.alive
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// Handles a writable event: confirms a pending connect, then drains the
    /// backlog.
    pub fn on_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.connected {
            match self.stream.take_error() {
                Ok(None) => {
                    if self.stream.peer_addr().is_ok() {
                        debug!(addr = %self.peer_addr, "connected");
                        self.connected = true;
                    } else {
                        // spurious wakeup, handshake still pending
                        return ConnState::Alive;
                    }
                }
                Ok(Some(err)) => {
                    warn!(addr = %self.peer_addr, %err, "connect failed");
                    self.alive = false;
                    return ConnState::Disconnected;
                }
                Err(err) => {
                    warn!(addr = %self.peer_addr, %err, "connect status unavailable");
                    self.alive = false;
                    return ConnState::Disconnected;
                }
            }
        }
        self.drain_backlog(registry)
    }

    /// Reads once into `buf`. 0 means no data was ready unless `is_alive`
    /// went false, in which case the peer closed or errored fatally.
    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        if !self.alive {
            return 0;
        }
        match self.stream.read(buf) {
            Ok(0) => {
                debug!(addr = %self.peer_addr, "peer closed");
                self.alive = false;
                0
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(err) => {
                warn!(addr = %self.peer_addr, %err, "tcp read failed");
                self.alive = false;
                0
            }
        }
    }

    /// Writes what the kernel takes; queues the rest for the next writable
    /// event. Returns false only on fatal error.
    pub fn write_data(&mut self, registry: &Registry, bytes: &[u8]) -> bool {
        if !self.alive {
            return false;
        }
        if !self.connected || !self.send_backlog.is_empty() {
            return self.enqueue(registry, bytes.to_vec()) == ConnState::Alive;
        }
        match self.stream.write(bytes) {
            Ok(n) if n == bytes.len() => true,
            Ok(0) => {
                warn!(addr = %self.peer_addr, "tcp write returned zero, disconnecting");
                self.alive = false;
                false
            }
            Ok(n) => self.enqueue(registry, bytes[n..].to_vec()) == ConnState::Alive,
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.enqueue(registry, bytes.to_vec()) == ConnState::Alive
            }
            Err(err) => {
                warn!(addr = %self.peer_addr, %err, "tcp write failed");
                self.alive = false;
                false
            }
        }
    }

    /// Flush queued data until the kernel blocks or the queue empties.
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front_mut() {
            match self.stream.write(front) {
                Ok(0) => {
                    self.alive = false;
                    return ConnState::Disconnected;
                }
                Ok(n) => {
                    if n == front.len() {
                        self.send_backlog.pop_front();
                    } else {
                        front.drain(..n);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(addr = %self.peer_addr, %err, "tcp backlog write failed");
                    self.alive = false;
                    return ConnState::Disconnected;
                }
            }
        }

        // Drop WRITABLE interest only when fully drained and connected
        if self.send_backlog.is_empty() && self.connected && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(%err, "tcp reregister drop writable");
                self.alive = false;
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }

        ConnState::Alive
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        self.send_backlog.push_back(data);
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(%err, "tcp reregister arm writable");
                self.alive = false;
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!(addr = %self.peer_addr, "terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.alive = false;
        self.connected = false;
        self.peer_addr
    }
}
