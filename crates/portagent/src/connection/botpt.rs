use mio::{Registry, Token};
use portagent_network::{ConnState, SocketError, TcpClient, TokenAlloc};
use tracing::info;

use crate::connection::{ConnEvent, ConnectionState};

/// BOTPT-style instrument: separate read and write sockets, both held open
/// for the life of the attachment. READY once both handshakes complete.
pub struct BotptInstrument {
    host: String,
    data_port: u16,
    command_port: u16,
    data: Option<TcpClient>,
    command: Option<TcpClient>,
    state: ConnectionState,
}

impl BotptInstrument {
    pub fn new(host: &str, data_port: u16, command_port: u16) -> Self {
        let state = if host.is_empty() || data_port == 0 || command_port == 0 {
            ConnectionState::Unconfigured
        } else {
            ConnectionState::Configured
        };
        Self {
            host: host.to_string(),
            data_port,
            command_port,
            data: None,
            command: None,
            state,
        }
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
            return Err(SocketError::MissingConfig("botpt host/ports"));
        }
        self.data = Some(TcpClient::connect(&self.host, self.data_port, registry, tokens.next())?);
        self.command =
            Some(TcpClient::connect(&self.host, self.command_port, registry, tokens.next())?);
        self.state = ConnectionState::Initializing;
        Ok(())
    }

    pub fn disconnect(&mut self, registry: &Registry) {
        if let Some(mut data) = self.data.take() {
            data.close(registry);
        }
        if let Some(mut command) = self.command.take() {
            command.close(registry);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn data_token(&self) -> Option<Token> {
        self.data.as_ref().map(|d| d.token())
    }

    pub fn command_token(&self) -> Option<Token> {
        self.command.as_ref().map(|c| c.token())
    }

    pub fn on_data_writable(&mut self, registry: &Registry) -> Option<ConnEvent> {
        match self.data.as_mut()?.on_writable(registry) {
            ConnState::Alive => self.maybe_ready(),
            ConnState::Disconnected => Some(ConnEvent::Failed("botpt data connect failed")),
        }
    }

    pub fn on_command_event(&mut self, registry: &Registry, writable: bool) -> Option<ConnEvent> {
        if !writable {
            return None;
        }
        match self.command.as_mut()?.on_writable(registry) {
            ConnState::Alive => self.maybe_ready(),
            ConnState::Disconnected => Some(ConnEvent::Failed("botpt command connect failed")),
        }
    }

    fn maybe_ready(&mut self) -> Option<ConnEvent> {
        if self.state == ConnectionState::Initializing
            && self.data.as_ref().is_some_and(|d| d.is_connected())
            && self.command.as_ref().is_some_and(|c| c.is_connected())
        {
            self.state = ConnectionState::Ready;
            info!(host = %self.host, "botpt instrument ready");
            return Some(ConnEvent::Ready);
        }
        None
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

    pub fn send_command(&mut self, registry: &Registry, bytes: &[u8]) -> bool {
        self.command.as_mut().is_some_and(|c| c.write_data(registry, bytes))
    }
}
