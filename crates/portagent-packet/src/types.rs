use bitflags::bitflags;

/// Wire packet type, one byte at header offset 3.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Unknown = 0,
    DataFromInstrument = 1,
    DataFromDriver = 2,
    PortAgentCommand = 3,
    PortAgentStatus = 4,
    PortAgentFault = 5,
    InstrumentCommand = 6,
    PortAgentHeartbeat = 7,
    DataFromRsn = 8,
}

impl PacketType {
    pub const fn from_wire(b: u8) -> Option<Self> {
        match b {
            0 => Some(Self::Unknown),
            1 => Some(Self::DataFromInstrument),
            2 => Some(Self::DataFromDriver),
            3 => Some(Self::PortAgentCommand),
            4 => Some(Self::PortAgentStatus),
            5 => Some(Self::PortAgentFault),
            6 => Some(Self::InstrumentCommand),
            7 => Some(Self::PortAgentHeartbeat),
            8 => Some(Self::DataFromRsn),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::DataFromInstrument => "DATA_FROM_INSTRUMENT",
            Self::DataFromDriver => "DATA_FROM_DRIVER",
            Self::PortAgentCommand => "PORT_AGENT_COMMAND",
            Self::PortAgentStatus => "PORT_AGENT_STATUS",
            Self::PortAgentFault => "PORT_AGENT_FAULT",
            Self::InstrumentCommand => "INSTRUMENT_COMMAND",
            Self::PortAgentHeartbeat => "PORT_AGENT_HEARTBEAT",
            Self::DataFromRsn => "DATA_FROM_RSN",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Accepted-type set carried by each publisher. Bit position is the wire
    /// discriminant.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct TypeFilter: u16 {
        const DATA_FROM_INSTRUMENT = 1 << 1;
        const DATA_FROM_DRIVER = 1 << 2;
        const PORT_AGENT_COMMAND = 1 << 3;
        const PORT_AGENT_STATUS = 1 << 4;
        const PORT_AGENT_FAULT = 1 << 5;
        const INSTRUMENT_COMMAND = 1 << 6;
        const PORT_AGENT_HEARTBEAT = 1 << 7;
        const DATA_FROM_RSN = 1 << 8;
    }
}

impl TypeFilter {
    #[inline]
    pub fn accepts(self, ty: PacketType) -> bool {
        ty != PacketType::Unknown &&
            self.contains(TypeFilter::from_bits_truncate(1u16 << (ty as u8)))
    }
}
