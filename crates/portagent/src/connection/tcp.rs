use mio::{Registry, Token};
use portagent_network::{ConnState, SocketError, TcpClient, TokenAlloc};
use tracing::info;

use crate::connection::{ConnEvent, ConnectionState};

/// Plain TCP instrument: one continuously held data socket.
pub struct TcpInstrument {
    host: String,
    port: u16,
    data: Option<TcpClient>,
    state: ConnectionState,
}

impl TcpInstrument {
    pub fn new(host: &str, port: u16) -> Self {
        let state = if host.is_empty() || port == 0 {
            ConnectionState::Unconfigured
        } else {
            ConnectionState::Configured
        };
        Self { host: host.to_string(), port, data: None, state }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn initialize(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
    ) -> Result<(), SocketError> {
        if self.state == ConnectionState::Unconfigured {
            return Err(SocketError::MissingConfig("instrument host/port"));
        }
        self.data = Some(TcpClient::connect(&self.host, self.port, registry, tokens.next())?);
        self.state = ConnectionState::Initializing;
        Ok(())
    }

    pub fn disconnect(&mut self, registry: &Registry) {
        if let Some(mut data) = self.data.take() {
            data.close(registry);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn data_token(&self) -> Option<Token> {
        self.data.as_ref().map(|d| d.token())
    }

    pub fn on_data_writable(&mut self, registry: &Registry) -> Option<ConnEvent> {
        let data = self.data.as_mut()?;
        match data.on_writable(registry) {
            ConnState::Alive => {
                if data.is_connected() && self.state == ConnectionState::Initializing {
                    info!(host = %self.host, port = self.port, "instrument connected");
                    self.state = ConnectionState::Ready;
                    return Some(ConnEvent::Ready);
                }
                None
            }
            ConnState::Disconnected => Some(ConnEvent::Failed("instrument connect failed")),
        }
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        self.data.as_mut().map_or(0, |d| d.read_data(buf))
    }

    pub fn data_alive(&self) -> bool {
        self.data.as_ref().is_some_and(|d| d.is_alive())
    }

    pub fn write_data(&mut self, registry: &Registry, bytes: &[u8]) -> bool {
        self.data.as_mut().is_some_and(|d| d.write_data(registry, bytes))
    }
}
