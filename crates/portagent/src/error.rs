use portagent_network::SocketError;
use portagent_packet::PacketError;
use thiserror::Error;

/// Top-level error for agent startup. During steady state I/O failures are
/// handled in place (disconnect + fault packet) and never reach this type.
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),
    #[error("bind failure on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: SocketError,
    },
    #[error("already running with pid {0}")]
    AlreadyRunning(u32),
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Process exit code: 1 config, 2 bind failure, 3 already running.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Bind { .. } => 2,
            Self::AlreadyRunning(_) => 3,
            _ => 1,
        }
    }
}
