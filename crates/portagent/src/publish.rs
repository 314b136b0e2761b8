use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
};

use mio::{Registry, Token};
use portagent_network::{TcpClient, TokenAlloc};
use portagent_packet::{Packet, PacketType, TypeFilter};
use portagent_timing::Nanos;
use tracing::{debug, warn};

use crate::connection::Connection;

/// Role of an accepted peer, one live peer per role.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ClientRole {
    DriverData,
    DriverCommand,
    Config,
    Sniffer,
}

/// The core's table of accepted peers. Publishers reference entries by
/// token and never own them.
#[derive(Default)]
pub struct ClientTable {
    items: Vec<(ClientRole, TcpClient)>,
}

impl ClientTable {
    pub fn add(&mut self, role: ClientRole, client: TcpClient) {
        self.items.push((role, client));
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut TcpClient> {
        self.items.iter_mut().find(|(_, c)| c.token() == token).map(|(_, c)| c)
    }

    pub fn role_of(&self, token: Token) -> Option<ClientRole> {
        self.items.iter().find(|(_, c)| c.token() == token).map(|(r, _)| *r)
    }

    pub fn token_of(&self, role: ClientRole) -> Option<Token> {
        self.items.iter().find(|(r, _)| *r == role).map(|(_, c)| c.token())
    }

    pub fn remove(&mut self, token: Token) -> Option<TcpClient> {
        let i = self.items.iter().position(|(_, c)| c.token() == token)?;
        Some(self.items.swap_remove(i).1)
    }

    /// Tokens of peers that have died since the last sweep.
    pub fn dead_tokens(&self) -> Vec<Token> {
        self.items.iter().filter(|(_, c)| !c.is_alive()).map(|(_, c)| c.token()).collect()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PublisherKind {
    DriverData,
    DriverCommand,
    InstrumentData,
    InstrumentCommand,
    LogFile,
    TcpDataListener,
    ConfigSession,
}

impl PublisherKind {
    const fn label(self) -> &'static str {
        match self {
            Self::DriverData => "driver data",
            Self::DriverCommand => "driver command",
            Self::InstrumentData => "instrument data",
            Self::InstrumentCommand => "instrument command",
            Self::LogFile => "log file",
            Self::TcpDataListener => "data listener",
            Self::ConfigSession => "config session",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// The full wire frame.
    Raw,
    /// The tagged log projection.
    Ascii,
    /// Payload bytes only, for sinks that must never see framing.
    Payload,
}

/// Day-rolling append-only log file under the configured log directory.
pub struct LogFile {
    dir: PathBuf,
    prefix: String,
    day: String,
    file: Option<File>,
}

impl LogFile {
    pub fn new(dir: PathBuf, prefix: String) -> Self {
        Self { dir, prefix, day: String::new(), file: None }
    }

    fn write(&mut self, bytes: &[u8], now: Nanos) -> io::Result<()> {
        let day = now.with_fmt_utc("%Y%m%d");
        if self.file.is_none() || day != self.day {
            fs::create_dir_all(&self.dir)?;
            let path = self.dir.join(format!("{}_{day}.log", self.prefix));
            self.file = Some(OpenOptions::new().create(true).append(true).open(path)?);
            self.day = day;
        }
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(io::Error::other("log file unavailable")),
        }
    }
}

enum SinkHandle {
    Client(Token),
    Instrument,
    File(LogFile),
}

/// Everything a publish pass needs that the list itself doesn't own: the
/// peer table, the instrument connection, the poll registry.
pub struct PublishCtx<'a> {
    pub registry: &'a Registry,
    pub clients: &'a mut ClientTable,
    pub conn: &'a mut Connection,
    pub tokens: &'a mut TokenAlloc,
    pub now: Nanos,
}

/// One fan-out sink: a kind, a non-owning sink handle, an accepted-type set
/// and an output format. Publishing a non-accepted type is a silent
/// success.
pub struct Publisher {
    kind: PublisherKind,
    sink: SinkHandle,
    filter: TypeFilter,
    format: OutputFormat,
}

impl Publisher {
    pub fn driver_data(token: Token) -> Self {
        Self {
            kind: PublisherKind::DriverData,
            sink: SinkHandle::Client(token),
            filter: TypeFilter::DATA_FROM_INSTRUMENT
                | TypeFilter::DATA_FROM_RSN
                | TypeFilter::PORT_AGENT_STATUS
                | TypeFilter::PORT_AGENT_FAULT
                | TypeFilter::PORT_AGENT_HEARTBEAT,
            format: OutputFormat::Raw,
        }
    }

    pub fn driver_command(token: Token) -> Self {
        Self {
            kind: PublisherKind::DriverCommand,
            sink: SinkHandle::Client(token),
            filter: TypeFilter::PORT_AGENT_COMMAND
                | TypeFilter::PORT_AGENT_STATUS
                | TypeFilter::PORT_AGENT_FAULT,
            format: OutputFormat::Raw,
        }
    }

    pub fn instrument_data() -> Self {
        Self {
            kind: PublisherKind::InstrumentData,
            sink: SinkHandle::Instrument,
            filter: TypeFilter::DATA_FROM_DRIVER,
            format: OutputFormat::Payload,
        }
    }

    pub fn instrument_command() -> Self {
        Self {
            kind: PublisherKind::InstrumentCommand,
            sink: SinkHandle::Instrument,
            filter: TypeFilter::INSTRUMENT_COMMAND,
            format: OutputFormat::Payload,
        }
    }

    pub fn log_file(dir: PathBuf, prefix: String) -> Self {
        Self {
            kind: PublisherKind::LogFile,
            sink: SinkHandle::File(LogFile::new(dir, prefix)),
            filter: TypeFilter::all(),
            format: OutputFormat::Ascii,
        }
    }

    /// Sniffer tap: mirrors the inbound instrument byte stream, unframed.
    pub fn data_listener(token: Token) -> Self {
        Self {
            kind: PublisherKind::TcpDataListener,
            sink: SinkHandle::Client(token),
            filter: TypeFilter::DATA_FROM_INSTRUMENT | TypeFilter::DATA_FROM_RSN,
            format: OutputFormat::Payload,
        }
    }

    /// Operator session: faults only, rendered as ASCII lines.
    pub fn config_session(token: Token) -> Self {
        Self {
            kind: PublisherKind::ConfigSession,
            sink: SinkHandle::Client(token),
            filter: TypeFilter::PORT_AGENT_FAULT,
            format: OutputFormat::Ascii,
        }
    }

    #[inline]
    pub fn wants(&self, ty: PacketType) -> bool {
        self.filter.accepts(ty)
    }

    pub fn sink_token(&self) -> Option<Token> {
        match self.sink {
            SinkHandle::Client(token) => Some(token),
            SinkHandle::Instrument | SinkHandle::File(_) => None,
        }
    }

    fn publish(&mut self, packet: &Packet, ctx: &mut PublishCtx<'_>) -> Result<(), String> {
        if !self.wants(packet.packet_type()) {
            return Ok(());
        }

        let ascii;
        let bytes: &[u8] = match self.format {
            OutputFormat::Raw => packet.to_bytes(),
            OutputFormat::Payload => packet.payload(),
            OutputFormat::Ascii => {
                ascii = packet.ascii();
                ascii.as_bytes()
            }
        };

        let ok = match &mut self.sink {
            SinkHandle::Client(token) => {
                // a vanished peer is not an error, the sweep already saw it
                let Some(client) = ctx.clients.get_mut(*token) else {
                    return Ok(());
                };
                client.write_data(ctx.registry, bytes)
            }
            SinkHandle::Instrument => match self.kind {
                PublisherKind::InstrumentCommand => {
                    ctx.conn.send_command(ctx.registry, ctx.tokens, ctx.now, bytes)
                }
                _ => ctx.conn.write_data(ctx.registry, bytes),
            },
            SinkHandle::File(log) => match log.write(bytes, ctx.now) {
                Ok(()) => true,
                Err(err) => {
                    warn!(%err, "log write failed");
                    false
                }
            },
        };

        if ok {
            Ok(())
        } else {
            Err(format!("{} publisher write failed", self.kind.label()))
        }
    }
}

/// Ordered fan-out set. Broadcast is serial in insertion order; per-sink
/// failures are collected and reported back as fault reasons so the core
/// can republish them (depth 1 only, faults are never re-faulted).
#[derive(Default)]
pub struct PublisherList {
    items: Vec<Publisher>,
}

impl PublisherList {
    pub fn add(&mut self, publisher: Publisher) {
        self.items.push(publisher);
    }

    /// Drops publishers bound to a closed peer.
    pub fn remove_sink(&mut self, token: Token) {
        self.items.retain(|p| p.sink_token() != Some(token));
    }

    pub fn publish_all(&mut self, packet: &Packet, ctx: &mut PublishCtx<'_>) -> Vec<String> {
        let mut failures = Vec::new();
        for publisher in &mut self.items {
            if let Err(reason) = publisher.publish(packet, ctx) {
                debug!(%reason, ty = %packet.packet_type(), "publish failed");
                failures.push(reason);
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use mio::Poll;
    use portagent_timing::NtpTimestamp;

    use super::*;
    use crate::connection::TcpInstrument;

    fn packet(ty: PacketType) -> Packet {
        Packet::build_raw(ty, NtpTimestamp::from_parts(3_800_000_000, 0), b"abc").unwrap()
    }

    #[test]
    fn test_accepted_type_matrix() {
        let driver_data = Publisher::driver_data(Token(1));
        for ty in [
            PacketType::DataFromInstrument,
            PacketType::DataFromRsn,
            PacketType::PortAgentStatus,
            PacketType::PortAgentFault,
            PacketType::PortAgentHeartbeat,
        ] {
            assert!(driver_data.wants(ty), "driver data should accept {ty}");
        }
        assert!(!driver_data.wants(PacketType::DataFromDriver));

        let driver_command = Publisher::driver_command(Token(2));
        assert!(driver_command.wants(PacketType::PortAgentCommand));
        assert!(driver_command.wants(PacketType::PortAgentFault));
        assert!(!driver_command.wants(PacketType::DataFromInstrument));

        assert!(Publisher::instrument_data().wants(PacketType::DataFromDriver));
        assert!(!Publisher::instrument_data().wants(PacketType::InstrumentCommand));
        assert!(Publisher::instrument_command().wants(PacketType::InstrumentCommand));

        let log = Publisher::log_file(PathBuf::from("/tmp"), "x".to_string());
        for b in 1u8..=8 {
            assert!(log.wants(PacketType::from_wire(b).unwrap()));
        }
    }

    #[test]
    fn test_filtered_publish_is_silent_success() {
        let poll = Poll::new().unwrap();
        let mut clients = ClientTable::default();
        let mut conn = Connection::Tcp(TcpInstrument::new("", 0));
        let mut tokens = TokenAlloc::default();
        let mut ctx = PublishCtx {
            registry: poll.registry(),
            clients: &mut clients,
            conn: &mut conn,
            tokens: &mut tokens,
            now: Nanos::ZERO,
        };

        // DriverCommand given DATA_FROM_INSTRUMENT: success, no write
        let mut list = PublisherList::default();
        list.add(Publisher::driver_command(Token(9)));
        let failures = list.publish_all(&packet(PacketType::DataFromInstrument), &mut ctx);
        assert!(failures.is_empty());
    }

    #[test]
    fn test_log_file_projection() {
        let dir = tempfile::tempdir().unwrap();
        let poll = Poll::new().unwrap();
        let mut clients = ClientTable::default();
        let mut conn = Connection::Tcp(TcpInstrument::new("", 0));
        let mut tokens = TokenAlloc::default();
        let now = Nanos::from_secs(1_700_000_000);
        let mut ctx = PublishCtx {
            registry: poll.registry(),
            clients: &mut clients,
            conn: &mut conn,
            tokens: &mut tokens,
            now,
        };

        let mut list = PublisherList::default();
        list.add(Publisher::log_file(dir.path().to_path_buf(), "portagent_9001".to_string()));
        let failures = list.publish_all(&packet(PacketType::DataFromInstrument), &mut ctx);
        assert!(failures.is_empty());

        let day = now.with_fmt_utc("%Y%m%d");
        let logged =
            fs::read_to_string(dir.path().join(format!("portagent_9001_{day}.log"))).unwrap();
        assert!(logged.contains("type=\"DATA_FROM_INSTRUMENT\""));
        assert!(logged.contains(">abc</port_agent_packet>"));
    }
}
