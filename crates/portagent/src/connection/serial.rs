use mio::{Registry, Token};
use portagent_network::{SerialPort, SocketError, TokenAlloc};
use tracing::info;

use crate::connection::ConnectionState;

/// Direct serial attachment. No handshake: the line is READY as soon as the
/// device opens.
pub struct SerialInstrument {
    path: String,
    baud: u32,
    port: Option<SerialPort>,
    state: ConnectionState,
}

impl SerialInstrument {
    pub fn new(path: &str, baud: u32) -> Self {
        let state = if path.is_empty() {
            ConnectionState::Unconfigured
        } else {
            ConnectionState::Configured
        };
        Self { path: path.to_string(), baud, port: None, state }
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
            return Err(SocketError::MissingConfig("serial device path"));
        }
        let mut port = SerialPort::open(&self.path, self.baud)?;
        port.register(registry, tokens.next())?;
        info!(path = %self.path, baud = self.baud, "serial line open");
        self.port = Some(port);
        self.state = ConnectionState::Ready;
        Ok(())
    }

    pub fn disconnect(&mut self, registry: &Registry) {
        if let Some(mut port) = self.port.take() {
            port.close(registry);
        }
        self.state = ConnectionState::Disconnected;
    }

    pub fn data_token(&self) -> Option<Token> {
        self.port.as_ref().map(|p| p.token())
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        self.port.as_mut().map_or(0, |p| p.read_data(buf))
    }

    pub fn data_alive(&self) -> bool {
        self.port.as_ref().is_some_and(|p| p.is_alive())
    }

    pub fn write_data(&mut self, bytes: &[u8]) -> bool {
        self.port.as_mut().is_some_and(|p| p.write_data(bytes))
    }
}
