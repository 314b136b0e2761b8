use std::{
    fmt,
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use portagent_packet::{HEADER_SIZE, MAX_PACKET_SIZE};
use portagent_timing::Nanos;

use crate::AgentError;

pub const DEFAULT_HEARTBEAT: Nanos = Nanos::from_secs(15);
pub const DEFAULT_MAX_PACKET_SIZE: usize = 4096 + HEADER_SIZE;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum InstrumentType {
    #[default]
    Tcp,
    Serial,
    Rsn,
    Botpt,
}

impl FromStr for InstrumentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "serial" => Ok(Self::Serial),
            "rsn" => Ok(Self::Rsn),
            "botpt" => Ok(Self::Botpt),
            other => Err(format!("unknown instrument type: {other}")),
        }
    }
}

impl fmt::Display for InstrumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Serial => "serial",
            Self::Rsn => "rsn",
            Self::Botpt => "botpt",
        })
    }
}

/// The runtime configuration record. Mutated in place by the command
/// language on the config port; persisted in the same one-command-per-line
/// format by `save`.
#[derive(Clone, Debug, PartialEq)]
pub struct PortAgentConfig {
    pub instrument_type: InstrumentType,
    pub instrument_data_host: String,
    pub instrument_data_port: u16,
    pub instrument_command_port: u16,
    pub device_path: String,
    pub baud: u32,
    pub data_port: u16,
    pub command_port: u16,
    pub config_port: u16,
    pub sniffer_port: Option<u16>,
    pub log_dir: PathBuf,
    pub heartbeat_interval: Nanos,
    /// Total framed size bound, header included.
    pub max_packet_size: usize,
}

impl Default for PortAgentConfig {
    fn default() -> Self {
        Self {
            instrument_type: InstrumentType::Tcp,
            instrument_data_host: "localhost".to_string(),
            instrument_data_port: 0,
            instrument_command_port: 0,
            device_path: String::new(),
            baud: 9600,
            data_port: 0,
            command_port: 0,
            config_port: 0,
            sniffer_port: None,
            log_dir: PathBuf::from("/tmp"),
            heartbeat_interval: DEFAULT_HEARTBEAT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

/// One line of the config-port command language.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    InstrumentType(InstrumentType),
    InstrumentDataPort(u16),
    InstrumentCommandPort(u16),
    InstrumentDataHost(String),
    DevicePath(String),
    Baud(u32),
    DataPort(u16),
    CommandPort(u16),
    SnifferPort(u16),
    LogDir(PathBuf),
    HeartbeatInterval(Nanos),
    MaxPacketSize(usize),
    Get(String),
    Break(u32),
    Save,
    Shutdown,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let Some(keyword) = parts.next() else {
            return Err("empty command".to_string());
        };
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(format!("{keyword}: too many arguments"));
        }

        fn required<'a>(keyword: &str, arg: Option<&'a str>) -> Result<&'a str, String> {
            arg.ok_or_else(|| format!("{keyword}: missing argument"))
        }
        fn num<T: FromStr>(keyword: &str, arg: Option<&str>) -> Result<T, String> {
            let raw = required(keyword, arg)?;
            raw.parse().map_err(|_| format!("{keyword}: bad value: {raw}"))
        }

        match keyword {
            "instrument_type" => {
                Ok(Self::InstrumentType(required(keyword, arg)?.parse::<InstrumentType>()?))
            }
            "instrument_data_port" => Ok(Self::InstrumentDataPort(num(keyword, arg)?)),
            "instrument_command_port" => Ok(Self::InstrumentCommandPort(num(keyword, arg)?)),
            "instrument_data_host" => {
                Ok(Self::InstrumentDataHost(required(keyword, arg)?.to_string()))
            }
            "device_path" => Ok(Self::DevicePath(required(keyword, arg)?.to_string())),
            "baud" => Ok(Self::Baud(num(keyword, arg)?)),
            "data_port" => Ok(Self::DataPort(num(keyword, arg)?)),
            "command_port" => Ok(Self::CommandPort(num(keyword, arg)?)),
            "sniffer_port" => Ok(Self::SnifferPort(num(keyword, arg)?)),
            "log_dir" => Ok(Self::LogDir(PathBuf::from(required(keyword, arg)?))),
            "heartbeat_interval" => {
                let raw = required(keyword, arg)?;
                // plain seconds first, humantime forms ("40ms") as a fallback
                let interval = raw
                    .parse::<u64>()
                    .map(Nanos::from_secs)
                    .or_else(|_| raw.parse::<Nanos>().map_err(|e| e.to_string()))?;
                Ok(Self::HeartbeatInterval(interval))
            }
            "max_packet_size" => {
                let size: usize = num(keyword, arg)?;
                if size <= HEADER_SIZE || size > MAX_PACKET_SIZE {
                    return Err(format!("max_packet_size: out of range: {size}"));
                }
                Ok(Self::MaxPacketSize(size))
            }
            "get" => Ok(Self::Get(required(keyword, arg)?.to_string())),
            "break" => Ok(Self::Break(match arg {
                Some(_) => num(keyword, arg)?,
                None => 0,
            })),
            "save" => Ok(Self::Save),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(format!("unrecognized command: {other}")),
        }
    }
}

/// What a config mutation touched; drives rebinds and reconnects.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigDelta {
    pub instrument: bool,
    pub data_port: bool,
    pub command_port: bool,
    pub sniffer_port: bool,
    pub heartbeat: bool,
    pub max_packet_size: bool,
}

impl ConfigDelta {
    pub fn any(&self) -> bool {
        *self != Self::default()
    }
}

impl PortAgentConfig {
    /// Applies a mutating command; `Get`, `Save` and `Shutdown` are handled
    /// by the caller and are no-ops here.
    pub fn apply(&mut self, cmd: &Command) -> ConfigDelta {
        let mut delta = ConfigDelta::default();

        fn set<T: PartialEq>(slot: &mut T, value: T, flag: &mut bool) {
            if *slot != value {
                *slot = value;
                *flag = true;
            }
        }

        match cmd {
            Command::InstrumentType(v) => set(&mut self.instrument_type, *v, &mut delta.instrument),
            Command::InstrumentDataPort(v) => {
                set(&mut self.instrument_data_port, *v, &mut delta.instrument);
            }
            Command::InstrumentCommandPort(v) => {
                set(&mut self.instrument_command_port, *v, &mut delta.instrument);
            }
            Command::InstrumentDataHost(v) => {
                set(&mut self.instrument_data_host, v.clone(), &mut delta.instrument);
            }
            Command::DevicePath(v) => set(&mut self.device_path, v.clone(), &mut delta.instrument),
            Command::Baud(v) => set(&mut self.baud, *v, &mut delta.instrument),
            Command::DataPort(v) => set(&mut self.data_port, *v, &mut delta.data_port),
            Command::CommandPort(v) => set(&mut self.command_port, *v, &mut delta.command_port),
            Command::SnifferPort(v) => {
                set(&mut self.sniffer_port, Some(*v), &mut delta.sniffer_port);
            }
            Command::LogDir(v) => {
                if self.log_dir != *v {
                    self.log_dir = v.clone();
                }
            }
            Command::HeartbeatInterval(v) => {
                set(&mut self.heartbeat_interval, *v, &mut delta.heartbeat);
            }
            Command::MaxPacketSize(v) => {
                set(&mut self.max_packet_size, *v, &mut delta.max_packet_size);
            }
            Command::Get(_) | Command::Break(_) | Command::Save | Command::Shutdown => {}
        }
        delta
    }

    pub fn get(&self, field: &str) -> Option<String> {
        match field {
            "instrument_type" => Some(self.instrument_type.to_string()),
            "instrument_data_host" => Some(self.instrument_data_host.clone()),
            "instrument_data_port" => Some(self.instrument_data_port.to_string()),
            "instrument_command_port" => Some(self.instrument_command_port.to_string()),
            "device_path" => Some(self.device_path.clone()),
            "baud" => Some(self.baud.to_string()),
            "data_port" => Some(self.data_port.to_string()),
            "command_port" => Some(self.command_port.to_string()),
            "sniffer_port" => Some(self.sniffer_port.map_or_else(String::new, |p| p.to_string())),
            "log_dir" => Some(self.log_dir.display().to_string()),
            "heartbeat_interval" => Some(self.heartbeat_interval.as_secs_u64().to_string()),
            "max_packet_size" => Some(self.max_packet_size.to_string()),
            _ => None,
        }
    }

    /// Startup validation; listening ports and the per-type instrument
    /// address must be complete before the agent boots.
    pub fn validate(&self) -> Result<(), AgentError> {
        let err = |msg: &str| Err(AgentError::Config(msg.to_string()));
        if self.config_port == 0 {
            return err("config port not set");
        }
        if self.data_port == 0 {
            return err("data_port not set");
        }
        if self.command_port == 0 {
            return err("command_port not set");
        }
        if self.max_packet_size <= HEADER_SIZE || self.max_packet_size > MAX_PACKET_SIZE {
            return err("max_packet_size out of range");
        }
        match self.instrument_type {
            InstrumentType::Tcp => {
                if self.instrument_data_host.is_empty() || self.instrument_data_port == 0 {
                    return err("tcp instrument requires instrument_data_host and instrument_data_port");
                }
            }
            InstrumentType::Rsn | InstrumentType::Botpt => {
                if self.instrument_data_host.is_empty()
                    || self.instrument_data_port == 0
                    || self.instrument_command_port == 0
                {
                    return err(
                        "rsn/botpt instrument requires instrument_data_host, instrument_data_port and instrument_command_port",
                    );
                }
            }
            InstrumentType::Serial => {
                if self.device_path.is_empty() {
                    return err("serial instrument requires device_path");
                }
            }
        }
        Ok(())
    }

    fn save_lines(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("instrument_type {}\n", self.instrument_type));
        out.push_str(&format!("instrument_data_host {}\n", self.instrument_data_host));
        out.push_str(&format!("instrument_data_port {}\n", self.instrument_data_port));
        out.push_str(&format!("instrument_command_port {}\n", self.instrument_command_port));
        if !self.device_path.is_empty() {
            out.push_str(&format!("device_path {}\n", self.device_path));
            out.push_str(&format!("baud {}\n", self.baud));
        }
        out.push_str(&format!("data_port {}\n", self.data_port));
        out.push_str(&format!("command_port {}\n", self.command_port));
        if let Some(p) = self.sniffer_port {
            out.push_str(&format!("sniffer_port {p}\n"));
        }
        out.push_str(&format!("log_dir {}\n", self.log_dir.display()));
        out.push_str(&format!("heartbeat_interval {}\n", self.heartbeat_interval.as_secs_u64()));
        out.push_str(&format!("max_packet_size {}\n", self.max_packet_size));
        out
    }

    pub fn save(&self, path: &Path) -> Result<(), AgentError> {
        fs::write(path, self.save_lines())?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let mut cfg = Self::default();
        let text = fs::read_to_string(path)?;
        for (lineno, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let cmd = Command::parse(line).map_err(|e| {
                AgentError::Config(format!("{}:{}: {e}", path.display(), lineno + 1))
            })?;
            cfg.apply(&cmd);
        }
        Ok(cfg)
    }

    pub fn pid_path(&self) -> PathBuf {
        self.log_dir.join(format!("portagent_{}.pid", self.config_port))
    }
}
