use mio::{Registry, Token};
use portagent_network::{ConnState, SocketError, TcpClient, TokenAlloc};
use tracing::{debug, info, warn};

use crate::connection::{ConnEvent, ConnectionState};

use portagent_timing::Nanos;

/// Greeting the DIGI prints on its command channel.
const DIGI_BANNER: &[u8] = b"OOI - Digi Command Interface\r\ntype help for command information\r\n";
const TIMESTAMPING_CMD: &[u8] = b"timestamping 2\r\n";
const TIMESTAMPING_ACK: &[u8] = b"Set Timestamping:On(binary)\r\n\r\n";

/// Every DIGI dialogue must complete within this window.
const DIALOGUE_TIMEOUT: Nanos = Nanos::from_secs(3);
/// Accumulation cap while waiting for an expected response.
const DIALOGUE_BUF: usize = 1000;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum DialogueGoal {
    Banner,
    TimestampAck,
    CommandAck,
}

/// One in-flight exchange on the DIGI command channel, advanced by the
/// event loop instead of a blocking poll. Success requires the first
/// `expected.len()` accumulated bytes to match `expected` exactly; an empty
/// expectation is satisfied by any response.
struct Dialogue {
    goal: DialogueGoal,
    expected: &'static [u8],
    acc: Vec<u8>,
    deadline: Nanos,
}

impl Dialogue {
    fn new(goal: DialogueGoal, expected: &'static [u8], now: Nanos) -> Self {
        Self { goal, expected, acc: Vec::new(), deadline: now + DIALOGUE_TIMEOUT }
    }

    /// Some(true) on confirmed match, Some(false) on confirmed mismatch,
    /// None while inconclusive.
    fn verdict(&self) -> Option<bool> {
        if self.expected.is_empty() {
            return (!self.acc.is_empty()).then_some(true);
        }
        if self.acc.len() < self.expected.len() {
            return None;
        }
        Some(&self.acc[..self.expected.len()] == self.expected)
    }
}

/// Instrument fronted by a DIGI terminal server: a continuously held data
/// socket plus a command socket opened on demand per dialogue and closed
/// right after each acknowledgement.
///
/// READY additionally gates on the DIGI banner and on `timestamping 2`
/// being acknowledged, so the data channel is known to carry binary
/// timestamped frames before anything is forwarded.
pub struct RsnInstrument {
    host: String,
    data_port: u16,
    command_port: u16,
    data: Option<TcpClient>,
    command: Option<TcpClient>,
    dialogue: Option<Dialogue>,
    binary_ts_on: bool,
    state: ConnectionState,
}

impl RsnInstrument {
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
            dialogue: None,
            binary_ts_on: false,
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
        now: Nanos,
    ) -> Result<(), SocketError> {
        if self.state == ConnectionState::Unconfigured {
            return Err(SocketError::MissingConfig("digi host/ports"));
        }
        self.data = Some(TcpClient::connect(&self.host, self.data_port, registry, tokens.next())?);
        self.command =
            Some(TcpClient::connect(&self.host, self.command_port, registry, tokens.next())?);
        self.dialogue = Some(Dialogue::new(DialogueGoal::Banner, DIGI_BANNER, now));
        self.binary_ts_on = false;
        self.state = ConnectionState::Initializing;
        Ok(())
    }

    pub fn disconnect(&mut self, registry: &Registry) {
        if let Some(mut data) = self.data.take() {
            data.close(registry);
        }
        self.close_command(registry);
        self.binary_ts_on = false;
        self.state = ConnectionState::Disconnected;
    }

    fn close_command(&mut self, registry: &Registry) {
        if let Some(mut command) = self.command.take() {
            command.close(registry);
        }
        self.dialogue = None;
    }

    pub fn data_token(&self) -> Option<Token> {
        self.data.as_ref().map(|d| d.token())
    }

    pub fn command_token(&self) -> Option<Token> {
        self.command.as_ref().map(|c| c.token())
    }

    pub fn on_data_writable(&mut self, registry: &Registry) -> Option<ConnEvent> {
        let data = self.data.as_mut()?;
        match data.on_writable(registry) {
            ConnState::Alive => self.maybe_ready(),
            ConnState::Disconnected => Some(ConnEvent::Failed("digi data connect failed")),
        }
    }

    pub fn on_command_event(
        &mut self,
        registry: &Registry,
        readable: bool,
        writable: bool,
        now: Nanos,
    ) -> Option<ConnEvent> {
        let command = self.command.as_mut()?;

        if writable && command.on_writable(registry) == ConnState::Disconnected {
            return Some(self.fail_dialogue(registry, "digi command channel lost"));
        }

        if readable {
            let mut chunk = [0u8; 256];
            loop {
                let n = command.read_data(&mut chunk);
                if n == 0 {
                    break;
                }
                if let Some(dialogue) = &mut self.dialogue
                    && dialogue.acc.len() < DIALOGUE_BUF
                {
                    dialogue.acc.extend_from_slice(&chunk[..n]);
                }
            }
            if !command.is_alive() {
                return Some(self.fail_dialogue(registry, "digi command channel closed"));
            }
        }

        match self.dialogue.as_ref().and_then(Dialogue::verdict) {
            Some(true) => self.advance_dialogue(registry, now),
            Some(false) => Some(self.fail_dialogue(registry, "unexpected digi response")),
            None => None,
        }
    }

    /// Moves the handshake forward after a confirmed expected response.
    fn advance_dialogue(&mut self, registry: &Registry, now: Nanos) -> Option<ConnEvent> {
        let goal = self.dialogue.as_ref().map(|d| d.goal)?;
        match goal {
            DialogueGoal::Banner => {
                debug!("digi banner received, enabling binary timestamping");
                let command = self.command.as_mut()?;
                if !command.write_data(registry, TIMESTAMPING_CMD) {
                    return Some(self.fail_dialogue(registry, "digi command write failed"));
                }
                self.dialogue =
                    Some(Dialogue::new(DialogueGoal::TimestampAck, TIMESTAMPING_ACK, now));
                None
            }
            DialogueGoal::TimestampAck => {
                info!(host = %self.host, "digi timestamping on");
                self.binary_ts_on = true;
                self.close_command(registry);
                self.maybe_ready()
            }
            DialogueGoal::CommandAck => {
                debug!("digi command acknowledged");
                self.close_command(registry);
                None
            }
        }
    }

    /// Aborting an init-phase dialogue tears the attachment down; a failed
    /// on-demand command only loses the command channel.
    fn fail_dialogue(&mut self, registry: &Registry, reason: &'static str) -> ConnEvent {
        let goal = self.dialogue.as_ref().map(|d| d.goal);
        self.close_command(registry);
        if self.state == ConnectionState::Initializing
            || !matches!(goal, Some(DialogueGoal::CommandAck))
        {
            warn!(reason, "digi handshake failed");
            ConnEvent::Failed(reason)
        } else {
            warn!(reason, "digi command failed");
            ConnEvent::CommandFailed(reason)
        }
    }

    fn maybe_ready(&mut self) -> Option<ConnEvent> {
        if self.state == ConnectionState::Initializing
            && self.binary_ts_on
            && self.data.as_ref().is_some_and(|d| d.is_connected())
        {
            self.state = ConnectionState::Ready;
            info!(host = %self.host, port = self.data_port, "rsn instrument ready");
            return Some(ConnEvent::Ready);
        }
        None
    }

    pub fn tick(&mut self, registry: &Registry, now: Nanos) -> Option<ConnEvent> {
        if self.dialogue.as_ref().is_some_and(|d| now >= d.deadline) {
            return Some(self.fail_dialogue(registry, "digi dialogue timeout"));
        }
        None
    }

    pub fn next_deadline(&self) -> Option<Nanos> {
        self.dialogue.as_ref().map(|d| d.deadline)
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

    /// Opens the command channel for one exchange. The channel is stateful
    /// and dialogues are never interleaved.
    pub fn send_command(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
        now: Nanos,
        bytes: &[u8],
    ) -> bool {
        if self.dialogue.is_some() {
            warn!("digi command channel busy, dropping command");
            return false;
        }
        let mut command =
            match TcpClient::connect(&self.host, self.command_port, registry, tokens.next()) {
                Ok(c) => c,
                Err(err) => {
                    warn!(%err, "couldn't open digi command channel");
                    return false;
                }
            };
        if !command.write_data(registry, bytes) {
            return false;
        }
        self.command = Some(command);
        self.dialogue = Some(Dialogue::new(DialogueGoal::CommandAck, b"", now));
        true
    }

    pub fn send_break(
        &mut self,
        registry: &Registry,
        tokens: &mut TokenAlloc,
        now: Nanos,
        millis: u32,
    ) -> bool {
        let cmd = format!("break {millis}\r\n");
        self.send_command(registry, tokens, now, cmd.as_bytes())
    }
}
