mod botpt;
mod rsn;
mod serial;
mod tcp;

pub use botpt::BotptInstrument;
pub use rsn::RsnInstrument;
pub use serial::SerialInstrument;
pub use tcp::TcpInstrument;

use mio::{Registry, Token};
use portagent_network::{SocketError, TokenAlloc};
use portagent_timing::Nanos;

use crate::config::{InstrumentType, PortAgentConfig};

/// Shared lifecycle of every instrument attachment.
///
/// UNCONFIGURED → CONFIGURED → INITIALIZING → READY → DISCONNECTED, and back
/// to CONFIGURED when the core retries `initialize`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Unconfigured,
    Configured,
    Initializing,
    Ready,
    Disconnected,
}

/// State-machine notifications surfaced to the core.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnEvent {
    /// The attachment completed initialization.
    Ready,
    /// The attachment is lost; the core disconnects, faults and backs off.
    Failed(&'static str),
    /// An on-demand command dialogue failed; the data link is unaffected.
    CommandFailed(&'static str),
}

/// One instrument attachment, dispatched by kind.
pub enum Connection {
    Tcp(TcpInstrument),
    Serial(SerialInstrument),
    Rsn(RsnInstrument),
    Botpt(BotptInstrument),
}

impl Connection {
    pub fn from_config(cfg: &PortAgentConfig) -> Self {
        match cfg.instrument_type {
            InstrumentType::Tcp => Self::Tcp(TcpInstrument::new(
                &cfg.instrument_data_host,
                cfg.instrument_data_port,
            )),
            InstrumentType::Serial => {
                Self::Serial(SerialInstrument::new(&cfg.device_path, cfg.baud))
            }
            InstrumentType::Rsn => Self::Rsn(RsnInstrument::new(
                &cfg.instrument_data_host,
                cfg.instrument_data_port,
                cfg.instrument_command_port,
            )),
            InstrumentType::Botpt => Self::Botpt(BotptInstrument::new(
                &cfg.instrument_data_host,
                cfg.instrument_data_port,
                cfg.instrument_command_port,
            )),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self {
            Self::Tcp(c) => c.state(),
            Self::Serial(c) => c.state(),
            Self::Rsn(c) => c.state(),
            Self::Botpt(c) => c.state(),
        }
    }

    #[inline]
    pub fn configured(&self) -> bool {
        self.state() != ConnectionState::Unconfigured
    }

    #[inline]
    pub fn initialized(&self) -> bool {
        matches!(self.state(), ConnectionState::Initializing | ConnectionState::Ready)
    }

    #[inline]
    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn initialize(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
        now: Nanos,
    ) -> Result<(), SocketError> {
        match self {
            Self::Tcp(c) => c.initialize(registry, tokens),
            Self::Serial(c) => c.initialize(registry, tokens),
            Self::Rsn(c) => c.initialize(registry, tokens, now),
            Self::Botpt(c) => c.initialize(registry, tokens),
        }
    }

    pub fn disconnect(&mut self, registry: &Registry) {
        match self {
            Self::Tcp(c) => c.disconnect(registry),
            Self::Serial(c) => c.disconnect(registry),
            Self::Rsn(c) => c.disconnect(registry),
            Self::Botpt(c) => c.disconnect(registry),
        }
    }

    pub fn data_token(&self) -> Option<Token> {
        match self {
            Self::Tcp(c) => c.data_token(),
            Self::Serial(c) => c.data_token(),
            Self::Rsn(c) => c.data_token(),
            Self::Botpt(c) => c.data_token(),
        }
    }

    pub fn command_token(&self) -> Option<Token> {
        match self {
            Self::Rsn(c) => c.command_token(),
            Self::Botpt(c) => c.command_token(),
            Self::Tcp(_) | Self::Serial(_) => None,
        }
    }

    pub fn on_data_writable(&mut self, registry: &Registry) -> Option<ConnEvent> {
        match self {
            Self::Tcp(c) => c.on_data_writable(registry),
            Self::Rsn(c) => c.on_data_writable(registry),
            Self::Botpt(c) => c.on_data_writable(registry),
            Self::Serial(_) => None,
        }
    }

    pub fn on_command_event(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        now: Nanos,
    ) -> Option<ConnEvent> {
        match self {
            Self::Rsn(c) => c.on_command_event(registry, readable, writable, now),
            Self::Botpt(c) => c.on_command_event(registry, writable),
            Self::Tcp(_) | Self::Serial(_) => None,
        }
    }

    pub fn read_data(&mut self, buf: &mut [u8]) -> usize {
        match self {
            Self::Tcp(c) => c.read_data(buf),
            Self::Serial(c) => c.read_data(buf),
            Self::Rsn(c) => c.read_data(buf),
            Self::Botpt(c) => c.read_data(buf),
        }
    }

    /// False once the data path has seen EOF or a fatal error.
    pub fn data_alive(&self) -> bool {
        match self {
            Self::Tcp(c) => c.data_alive(),
            Self::Serial(c) => c.data_alive(),
            Self::Rsn(c) => c.data_alive(),
            Self::Botpt(c) => c.data_alive(),
        }
    }

    pub fn write_data(&mut self, registry: &Registry, bytes: &[u8]) -> bool {
        match self {
            Self::Tcp(c) => c.write_data(registry, bytes),
            Self::Serial(c) => c.write_data(bytes),
            Self::Rsn(c) => c.write_data(registry, bytes),
            Self::Botpt(c) => c.write_data(registry, bytes),
        }
    }

    pub fn send_break(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
        now: Nanos,
        millis: u32,
    ) -> bool {
        match self {
            Self::Rsn(c) => c.send_break(registry, tokens, now, millis),
            Self::Tcp(_) | Self::Serial(_) | Self::Botpt(_) => false,
        }
    }

    pub fn send_command(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
        now: Nanos,
        bytes: &[u8],
    ) -> bool {
        match self {
            Self::Rsn(c) => c.send_command(registry, tokens, now, bytes),
            Self::Botpt(c) => c.send_command(registry, bytes),
            Self::Tcp(_) | Self::Serial(_) => false,
        }
    }

    /// Deadline-driven work (RSN dialogue expiry).
    pub fn tick(&mut self, registry: &Registry, now: Nanos) -> Option<ConnEvent> {
        match self {
            Self::Rsn(c) => c.tick(registry, now),
            Self::Tcp(_) | Self::Serial(_) | Self::Botpt(_) => None,
        }
    }

    /// Nearest internal deadline, for the core's poll timeout.
    pub fn next_deadline(&self) -> Option<Nanos> {
        match self {
            Self::Rsn(c) => c.next_deadline(),
            Self::Tcp(_) | Self::Serial(_) | Self::Botpt(_) => None,
        }
    }

    /// RSN attachments deliver pre-framed blobs rather than a raw stream.
    #[inline]
    pub fn delivers_framed(&self) -> bool {
        matches!(self, Self::Rsn(_))
    }
}
