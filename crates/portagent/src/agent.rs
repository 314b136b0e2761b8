use std::{
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use mio::{Events, Poll, Registry, Token};
use portagent_network::{TcpAcceptor, TokenAlloc};
use portagent_packet::{BufferedPacket, FrameSplitter, HEADER_SIZE, Packet, PacketType};
use portagent_timing::{Backoff, Nanos, NtpTimestamp, Repeater};
use tracing::{debug, error, info, warn};

use crate::{
    AgentError,
    config::{Command, PortAgentConfig},
    connection::{ConnEvent, Connection, ConnectionState},
    publish::{ClientRole, ClientTable, PublishCtx, Publisher, PublisherList},
};

pub const DEFAULT_FLUSH_TIMEOUT: Nanos = Nanos::from_millis(40);
const POLL_MIN: Duration = Duration::from_millis(1);
const POLL_MAX: Duration = Duration::from_millis(100);
const RECONNECT_BASE: Nanos = Nanos::from_secs(1);
const RECONNECT_CAP: Nanos = Nanos::from_secs(30);
const READ_CHUNK: usize = 4096;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Listener {
    Data,
    Command,
    Config,
    Sniffer,
}

impl Listener {
    const fn role(self) -> ClientRole {
        match self {
            Self::Data => ClientRole::DriverData,
            Self::Command => ClientRole::DriverCommand,
            Self::Config => ClientRole::Config,
            Self::Sniffer => ClientRole::Sniffer,
        }
    }
}

/// The port-agent core: one connection, the listener set, the publisher
/// fan-out and every timer, multiplexed on a single poll.
///
/// All waits happen at the one `poll` call per cycle; everything else is
/// bounded work, so there is exactly one suspension point and no data races
/// by construction.
pub struct PortAgent {
    cfg: PortAgentConfig,
    cfg_path: Option<PathBuf>,
    poll: Poll,
    events: Events,
    tokens: TokenAlloc,
    conn: Connection,
    backoff: Backoff,
    data_acceptor: TcpAcceptor,
    command_acceptor: TcpAcceptor,
    config_acceptor: TcpAcceptor,
    sniffer_acceptor: Option<TcpAcceptor>,
    clients: ClientTable,
    publishers: PublisherList,
    inbound: BufferedPacket,
    rsn_frames: FrameSplitter,
    driver_cmd: BufferedPacket,
    config_lines: HashMap<Token, Vec<u8>>,
    heartbeat: Repeater,
    /// The instrument address changed while no attachment was connected;
    /// the connection is rebuilt from config before the next initialize.
    conn_stale: bool,
    shutdown: Arc<AtomicUsize>,
}

fn bind_local(
    port: u16,
    registry: &Registry,
    tokens: &mut TokenAlloc,
) -> Result<TcpAcceptor, AgentError> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpAcceptor::bind(addr, registry, tokens.next())
        .map_err(|source| AgentError::Bind { port, source })
}

impl PortAgent {
    pub fn new(
        cfg: PortAgentConfig,
        cfg_path: Option<PathBuf>,
        shutdown: Arc<AtomicUsize>,
    ) -> Result<Self, AgentError> {
        cfg.validate()?;
        let poll = Poll::new()?;
        let mut tokens = TokenAlloc::default();

        let data_acceptor = bind_local(cfg.data_port, poll.registry(), &mut tokens)?;
        let command_acceptor = bind_local(cfg.command_port, poll.registry(), &mut tokens)?;
        let config_acceptor = bind_local(cfg.config_port, poll.registry(), &mut tokens)?;
        let sniffer_acceptor = match cfg.sniffer_port {
            Some(port) => Some(bind_local(port, poll.registry(), &mut tokens)?),
            None => None,
        };

        let conn = Connection::from_config(&cfg);

        let mut publishers = PublisherList::default();
        publishers.add(Publisher::instrument_data());
        publishers.add(Publisher::instrument_command());
        publishers
            .add(Publisher::log_file(cfg.log_dir.clone(), format!("portagent_{}", cfg.config_port)));

        let payload_cap = cfg.max_packet_size - HEADER_SIZE;
        let inbound =
            BufferedPacket::new(PacketType::DataFromInstrument, payload_cap, DEFAULT_FLUSH_TIMEOUT);
        let driver_cmd =
            BufferedPacket::new(PacketType::DataFromDriver, payload_cap, DEFAULT_FLUSH_TIMEOUT);
        let heartbeat = Repeater::every(cfg.heartbeat_interval);

        Ok(Self {
            cfg,
            cfg_path,
            poll,
            events: Events::with_capacity(128),
            tokens,
            conn,
            backoff: Backoff::new(RECONNECT_BASE, RECONNECT_CAP),
            data_acceptor,
            command_acceptor,
            config_acceptor,
            sniffer_acceptor,
            clients: ClientTable::default(),
            publishers,
            inbound,
            rsn_frames: FrameSplitter::default(),
            driver_cmd,
            config_lines: HashMap::new(),
            heartbeat,
            conn_stale: false,
            shutdown,
        })
    }

    pub fn data_addr(&self) -> Option<SocketAddr> {
        self.data_acceptor.local_addr()
    }

    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_acceptor.local_addr()
    }

    pub fn config_addr(&self) -> Option<SocketAddr> {
        self.config_acceptor.local_addr()
    }

    pub fn sniffer_addr(&self) -> Option<SocketAddr> {
        self.sniffer_acceptor.as_ref().and_then(|a| a.local_addr())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn config(&self) -> &PortAgentConfig {
        &self.cfg
    }

    /// True while a peer of this role is attached.
    pub fn has_peer(&self, role: ClientRole) -> bool {
        self.clients.token_of(role).is_some()
    }

    /// Arms the periodic timers; `run` does this before its first cycle.
    pub fn start(&mut self, now: Nanos) {
        self.heartbeat.reset(now);
    }

    /// Runs until the shutdown flag is raised, then finishes the current
    /// cycle and drains whatever is still buffered.
    pub fn run(&mut self) -> Result<(), AgentError> {
        self.start(Nanos::now());
        info!(
            data = ?self.data_addr(),
            command = ?self.command_addr(),
            config = ?self.config_addr(),
            "port agent up"
        );
        while self.shutdown.load(Ordering::Relaxed) == 0 {
            self.run_once(Nanos::now());
        }
        info!("shutdown requested, draining");
        let now = Nanos::now();
        self.inbound.flush();
        self.driver_cmd.flush();
        self.drain_buffers(now);
        Ok(())
    }

    /// One event-loop cycle. Public so tests can single-step the loop with
    /// a controlled clock.
    pub fn run_once(&mut self, now: Nanos) {
        let timeout = self.poll_timeout(now);
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => self.events.clear(),
            Err(err) => {
                error!(%err, "poll failed");
                self.events.clear();
            }
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            self.handle_token(token, readable, writable, now);
        }

        if let Some(ev) = self.conn.tick(self.poll.registry(), now) {
            self.handle_conn_event(ev, now);
        }

        // EOF on the instrument path surfaces here, after the reads
        if self.conn.initialized() && !self.conn.data_alive() {
            self.instrument_lost(now);
        }

        self.drain_buffers(now);

        if self.heartbeat.fired(now) {
            self.emit_heartbeat(now);
        }

        self.maybe_reconnect(now);
        self.sweep_dead_clients();
    }

    /// Sleep until the nearest deadline, clamped to [1 ms, 100 ms].
    fn poll_timeout(&self, now: Nanos) -> Duration {
        let mut due = self.heartbeat.next_due();
        if let Some(d) = self.inbound.flush_due() {
            due = due.min(d);
        }
        if let Some(d) = self.driver_cmd.flush_due() {
            due = due.min(d);
        }
        if let Some(d) = self.conn.next_deadline() {
            due = due.min(d);
        }
        if self.conn.state() == ConnectionState::Disconnected {
            due = due.min(self.backoff.next_due());
        }
        Duration::from(due.saturating_sub(now)).clamp(POLL_MIN, POLL_MAX)
    }

    fn handle_token(&mut self, token: Token, readable: bool, writable: bool, now: Nanos) {
        if token == self.data_acceptor.token() {
            return self.accept_peers(Listener::Data);
        }
        if token == self.command_acceptor.token() {
            return self.accept_peers(Listener::Command);
        }
        if token == self.config_acceptor.token() {
            return self.accept_peers(Listener::Config);
        }
        if self.sniffer_acceptor.as_ref().is_some_and(|a| a.token() == token) {
            return self.accept_peers(Listener::Sniffer);
        }

        if Some(token) == self.conn.data_token() {
            if writable && let Some(ev) = self.conn.on_data_writable(self.poll.registry()) {
                self.handle_conn_event(ev, now);
            }
            if readable {
                self.read_instrument(now);
            }
            return;
        }
        if Some(token) == self.conn.command_token() {
            if let Some(ev) =
                self.conn.on_command_event(self.poll.registry(), readable, writable, now)
            {
                self.handle_conn_event(ev, now);
            }
            return;
        }

        let Some(role) = self.clients.role_of(token) else {
            debug!(?token, "event for unknown token");
            return;
        };
        if writable && let Some(client) = self.clients.get_mut(token) {
            client.on_writable(self.poll.registry());
        }
        if readable {
            match role {
                ClientRole::DriverCommand => self.read_driver_command(token, now),
                ClientRole::Config => self.read_config_lines(token, now),
                ClientRole::DriverData | ClientRole::Sniffer => self.discard_reads(token),
            }
        }
    }

    /// Accepts every pending peer on a listener. One live peer per role: a
    /// newer accept replaces the prior peer, which is closed.
    fn accept_peers(&mut self, which: Listener) {
        loop {
            let peer_token = self.tokens.next();
            let accepted = match which {
                Listener::Data => self.data_acceptor.accept(self.poll.registry(), peer_token),
                Listener::Command => self.command_acceptor.accept(self.poll.registry(), peer_token),
                Listener::Config => self.config_acceptor.accept(self.poll.registry(), peer_token),
                Listener::Sniffer => self
                    .sniffer_acceptor
                    .as_mut()
                    .and_then(|a| a.accept(self.poll.registry(), peer_token)),
            };
            let Some(client) = accepted else { return };

            let role = which.role();
            if let Some(prior) = self.clients.token_of(role) {
                info!(?role, "replacing prior peer");
                self.drop_client(prior);
            }
            match role {
                ClientRole::DriverData => self.publishers.add(Publisher::driver_data(peer_token)),
                ClientRole::DriverCommand => {
                    self.publishers.add(Publisher::driver_command(peer_token));
                }
                ClientRole::Sniffer => self.publishers.add(Publisher::data_listener(peer_token)),
                ClientRole::Config => {
                    self.publishers.add(Publisher::config_session(peer_token));
                    self.config_lines.insert(peer_token, Vec::new());
                }
            }
            self.clients.add(role, client);
        }
    }

    fn drop_client(&mut self, token: Token) {
        if let Some(mut client) = self.clients.remove(token) {
            client.close(self.poll.registry());
        }
        self.publishers.remove_sink(token);
        self.config_lines.remove(&token);
    }

    fn read_instrument(&mut self, now: Nanos) {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = self.conn.read_data(&mut chunk);
            if n == 0 {
                break;
            }
            if self.conn.delivers_framed() {
                self.rsn_frames.push(&chunk[..n]);
            } else {
                self.inbound.push(&chunk[..n], now);
            }
        }
    }

    fn read_driver_command(&mut self, token: Token, now: Nanos) {
        let Some(client) = self.clients.get_mut(token) else { return };
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let n = client.read_data(&mut chunk);
            if n == 0 {
                break;
            }
            self.driver_cmd.push(&chunk[..n], now);
        }
    }

    /// Driver-data and sniffer peers never send anything meaningful; reads
    /// only serve EOF detection.
    fn discard_reads(&mut self, token: Token) {
        let Some(client) = self.clients.get_mut(token) else { return };
        let mut chunk = [0u8; 256];
        while client.read_data(&mut chunk) > 0 {}
    }

    fn read_config_lines(&mut self, token: Token, now: Nanos) {
        let mut lines = Vec::new();
        {
            let Self { clients, config_lines, .. } = self;
            let Some(client) = clients.get_mut(token) else { return };
            let buf = config_lines.entry(token).or_default();
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                let n = client.read_data(&mut chunk);
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&line).trim().to_string());
            }
        }
        for line in lines {
            if !line.is_empty() {
                self.handle_config_line(token, &line, now);
            }
        }
    }

    fn handle_config_line(&mut self, token: Token, line: &str, now: Nanos) {
        debug!(line, "config command");
        let cmd = match Command::parse(line) {
            Ok(cmd) => cmd,
            Err(reason) => {
                self.emit_fault(&format!("bad config command: {reason}"), now);
                return;
            }
        };
        match cmd {
            Command::Get(field) => match self.cfg.get(&field) {
                Some(value) => self.reply(token, &format!("{field} {value}\r\n")),
                None => self.emit_fault(&format!("unknown field: {field}"), now),
            },
            Command::Save => {
                let path = self.cfg_path.clone().unwrap_or_else(|| {
                    self.cfg.log_dir.join(format!("portagent_{}.conf", self.cfg.config_port))
                });
                match self.cfg.save(&path) {
                    Ok(()) => self.reply(token, "saved\r\n"),
                    Err(err) => self.emit_fault(&format!("save failed: {err}"), now),
                }
            }
            Command::Break(millis) => {
                let Self { conn, poll, tokens, .. } = self;
                if conn.send_break(poll.registry(), tokens, now, millis) {
                    self.reply(token, "break sent\r\n");
                } else {
                    self.emit_fault("break not supported or channel busy", now);
                }
            }
            Command::Shutdown => {
                info!("shutdown via config port");
                self.shutdown.store(1, Ordering::Relaxed);
            }
            other => self.apply_config(&other, line, now),
        }
    }

    fn reply(&mut self, token: Token, text: &str) {
        if let Some(client) = self.clients.get_mut(token) {
            client.write_data(self.poll.registry(), text.as_bytes());
        }
    }

    fn apply_config(&mut self, cmd: &Command, line: &str, now: Nanos) {
        let delta = self.cfg.apply(cmd);
        self.emit_command_audit(line, now);
        if !delta.any() {
            return;
        }
        if delta.heartbeat {
            self.heartbeat.set_interval(self.cfg.heartbeat_interval);
            self.heartbeat.reset(now);
        }
        if delta.max_packet_size {
            let payload_cap = self.cfg.max_packet_size - HEADER_SIZE;
            self.inbound.set_max_payload(payload_cap);
            self.driver_cmd.set_max_payload(payload_cap);
        }
        if delta.data_port {
            self.rebind(Listener::Data, now);
        }
        if delta.command_port {
            self.rebind(Listener::Command, now);
        }
        if delta.sniffer_port {
            self.rebind(Listener::Sniffer, now);
        }
        if delta.instrument {
            // an address change bounces a connected attachment at once;
            // otherwise it is recorded silently and the next initialize
            // dials the new address
            if self.conn.connected() {
                self.conn.disconnect(self.poll.registry());
                self.conn = Connection::from_config(&self.cfg);
                self.conn_stale = false;
                self.backoff.reset();
                self.emit_status("instrument reconfigured, reconnecting", now);
            } else {
                self.conn_stale = true;
            }
        }
    }

    /// Closes a listener and its peer, then binds the newly configured port.
    fn rebind(&mut self, which: Listener, now: Nanos) {
        if let Some(prior) = self.clients.token_of(which.role()) {
            self.drop_client(prior);
        }
        let result = match which {
            Listener::Data => {
                self.data_acceptor.close(self.poll.registry());
                bind_local(self.cfg.data_port, self.poll.registry(), &mut self.tokens)
                    .map(|acc| self.data_acceptor = acc)
            }
            Listener::Command => {
                self.command_acceptor.close(self.poll.registry());
                bind_local(self.cfg.command_port, self.poll.registry(), &mut self.tokens)
                    .map(|acc| self.command_acceptor = acc)
            }
            Listener::Sniffer => {
                if let Some(acc) = &mut self.sniffer_acceptor {
                    acc.close(self.poll.registry());
                }
                match self.cfg.sniffer_port {
                    Some(port) => bind_local(port, self.poll.registry(), &mut self.tokens)
                        .map(|acc| self.sniffer_acceptor = Some(acc)),
                    None => {
                        self.sniffer_acceptor = None;
                        Ok(())
                    }
                }
            }
            Listener::Config => Ok(()),
        };
        match result {
            Ok(()) => info!(?which, "listener rebound"),
            Err(err) => self.emit_fault(&format!("rebind failed: {err}"), now),
        }
    }

    fn handle_conn_event(&mut self, ev: ConnEvent, now: Nanos) {
        match ev {
            ConnEvent::Ready => {
                self.backoff.reset();
                self.emit_status("instrument connected", now);
            }
            ConnEvent::Failed(reason) => {
                self.conn.disconnect(self.poll.registry());
                self.backoff.bump(now);
                self.emit_fault(reason, now);
            }
            ConnEvent::CommandFailed(reason) => self.emit_fault(reason, now),
        }
    }

    fn instrument_lost(&mut self, now: Nanos) {
        warn!("instrument disconnected");
        self.conn.disconnect(self.poll.registry());
        self.backoff.bump(now);
        self.emit_fault("instrument disconnected", now);
    }

    fn maybe_reconnect(&mut self, now: Nanos) {
        // adopt a recorded address change once no attempt is in flight
        if self.conn_stale
            && !matches!(
                self.conn.state(),
                ConnectionState::Initializing | ConnectionState::Ready
            )
        {
            self.conn = Connection::from_config(&self.cfg);
            self.conn_stale = false;
        }
        let state = self.conn.state();
        let retry = matches!(state, ConnectionState::Configured | ConnectionState::Disconnected)
            && self.backoff.due(now);
        if !retry {
            return;
        }
        let Self { conn, poll, tokens, .. } = self;
        match conn.initialize(poll.registry(), tokens, now) {
            Ok(()) => {
                debug!("instrument initialize issued");
                if self.conn.connected() {
                    // serial lines come up synchronously
                    self.backoff.reset();
                    self.emit_status("instrument connected", now);
                }
            }
            Err(err) => {
                self.backoff.bump(now);
                let msg = format!("instrument initialize failed: {err}");
                self.emit_fault(&msg, now);
            }
        }
    }

    /// Drain order: inbound data, then driver commands; status and
    /// heartbeat packets are emitted after.
    fn drain_buffers(&mut self, now: Nanos) {
        self.inbound.tick(now);
        self.driver_cmd.tick(now);

        loop {
            match self.inbound.drain() {
                Ok(Some(pkt)) => self.publish(&pkt, now),
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "dropping malformed inbound buffer");
                    self.inbound.reset();
                    break;
                }
            }
        }
        while let Some(frame) = self.rsn_frames.next_frame() {
            match Packet::from_rsn(&frame) {
                Ok(pkt) => self.publish(&pkt, now),
                Err(err) => warn!(%err, "discarding malformed rsn frame"),
            }
        }
        loop {
            match self.driver_cmd.drain() {
                Ok(Some(pkt)) => self.publish(&pkt, now),
                Ok(None) => break,
                Err(err) => {
                    warn!(%err, "dropping malformed command buffer");
                    self.driver_cmd.reset();
                    break;
                }
            }
        }
    }

    fn publish(&mut self, packet: &Packet, now: Nanos) {
        let failures = {
            let Self { publishers, clients, conn, tokens, poll, .. } = self;
            let mut ctx =
                PublishCtx { registry: poll.registry(), clients, conn, tokens, now };
            publishers.publish_all(packet, &mut ctx)
        };
        // depth 1 only: faults are not re-faulted
        if packet.packet_type() == PacketType::PortAgentFault {
            return;
        }
        for reason in failures {
            match Packet::build_raw(
                PacketType::PortAgentFault,
                NtpTimestamp::from_nanos(now),
                reason.as_bytes(),
            ) {
                Ok(fault) => {
                    let Self { publishers, clients, conn, tokens, poll, .. } = self;
                    let mut ctx =
                        PublishCtx { registry: poll.registry(), clients, conn, tokens, now };
                    let _ = publishers.publish_all(&fault, &mut ctx);
                }
                Err(err) => error!(%err, "couldn't frame fault packet"),
            }
        }
    }

    fn emit_packet(&mut self, ty: PacketType, payload: &[u8], now: Nanos) {
        match Packet::build_raw(ty, NtpTimestamp::from_nanos(now), payload) {
            Ok(pkt) => self.publish(&pkt, now),
            Err(err) => error!(%err, ty = %ty, "couldn't frame packet"),
        }
    }

    fn emit_fault(&mut self, reason: &str, now: Nanos) {
        warn!(reason, "fault");
        self.emit_packet(PacketType::PortAgentFault, reason.as_bytes(), now);
    }

    fn emit_status(&mut self, status: &str, now: Nanos) {
        info!(status, "status change");
        self.emit_packet(PacketType::PortAgentStatus, status.as_bytes(), now);
    }

    fn emit_heartbeat(&mut self, now: Nanos) {
        debug!("heartbeat");
        self.emit_packet(PacketType::PortAgentHeartbeat, &[], now);
    }

    /// Mutating config commands are echoed to command sinks and the log.
    fn emit_command_audit(&mut self, line: &str, now: Nanos) {
        self.emit_packet(PacketType::PortAgentCommand, line.as_bytes(), now);
    }

    fn sweep_dead_clients(&mut self) {
        for token in self.clients.dead_tokens() {
            info!(?token, "client session closed");
            self.drop_client(token);
        }
    }
}
