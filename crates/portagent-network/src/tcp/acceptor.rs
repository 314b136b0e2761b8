use std::net::SocketAddr;

use mio::{Interest, Registry, Token, net::TcpListener};
use tracing::{info, warn};

use crate::{SocketError, tcp::TcpClient};

/// Non-blocking listener that hands each accepted peer to the caller.
///
/// The single-peer policy (a second accept replaces and closes the prior
/// peer) is enforced by the owner, which knows which peer a listener feeds.
pub struct TcpAcceptor {
    listener: TcpListener,
    token: Token,
}

impl TcpAcceptor {
    pub fn bind(addr: SocketAddr, registry: &Registry, token: Token) -> Result<Self, SocketError> {
        let mut listener = TcpListener::bind(addr).map_err(SocketError::CreateFailure)?;
        registry
            .register(&mut listener, token, Interest::READABLE)
            .map_err(SocketError::CreateFailure)?;
        Ok(Self { listener, token })
    }

    #[inline]
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accepts one pending peer, if any.
    pub fn accept(&mut self, registry: &Registry, peer_token: Token) -> Option<TcpClient> {
        match self.listener.accept() {
            Ok((stream, addr)) => {
                info!(%addr, "client connected");
                match TcpClient::from_accepted(stream, addr, registry, peer_token) {
                    Ok(client) => Some(client),
                    Err(err) => {
                        warn!(%addr, %err, "couldn't register accepted client");
                        None
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!(%err, "accept failed");
                None
            }
        }
    }

    pub fn close(&mut self, registry: &Registry) {
        let _ = registry.deregister(&mut self.listener);
    }
}
