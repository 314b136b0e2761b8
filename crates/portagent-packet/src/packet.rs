use portagent_timing::NtpTimestamp;
use tracing::warn;

use crate::{PacketError, PacketType};

/// Frame sync bytes at offsets 0..3.
pub const SYNC: [u8; 3] = [0xA3, 0x9D, 0x7A];
pub const HEADER_SIZE: usize = 16;
pub const MAX_PACKET_SIZE: usize = 65_535;
pub const MAX_PAYLOAD: usize = MAX_PACKET_SIZE - HEADER_SIZE;

const TYPE_OFFSET: usize = 3;
pub(crate) const SIZE_OFFSET: usize = 4;
const CHECKSUM_OFFSET: usize = 6;
const TIMESTAMP_OFFSET: usize = 8;

/// One framed binary packet.
///
/// Owns its full wire frame (header + payload) in a single buffer, moved not
/// copied through the pipeline. Header fields are immutable after
/// construction.
///
/// `kind` is the routing classification. It equals the header type byte for
/// packets the agent frames itself; for DIGI-framed blobs it is
/// DATA_FROM_RSN while the wire bytes stay exactly as received, checksum
/// included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    kind: PacketType,
    buf: Vec<u8>,
}

impl Packet {
    /// Frames `payload` with a fresh header. The checksum is computed over
    /// the whole frame with the checksum field zeroed.
    pub fn build_raw(
        ty: PacketType,
        ts: NtpTimestamp,
        payload: &[u8],
    ) -> Result<Self, PacketError> {
        if ty == PacketType::Unknown {
            return Err(PacketError::ParamOutOfRange("packet type UNKNOWN"));
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(PacketError::ParamOutOfRange("payload exceeds 65519 bytes"));
        }

        let size = (HEADER_SIZE + payload.len()) as u16;
        let mut buf = Vec::with_capacity(size as usize);
        buf.extend_from_slice(&SYNC);
        buf.push(ty as u8);
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&ts.to_be_bytes());
        buf.extend_from_slice(payload);

        let checksum = compute_checksum(&buf);
        buf[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());

        Ok(Self { kind: ty, buf })
    }

    /// Parses and validates a frame the agent itself produced (or a driver
    /// replayed): sync, type, size bounds and checksum must all hold.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PacketError> {
        validate_frame(bytes)?;
        let Some(ty) = PacketType::from_wire(bytes[TYPE_OFFSET]) else {
            return Err(PacketError::Malformed("unrecognized type byte"));
        };
        if ty == PacketType::Unknown {
            return Err(PacketError::Malformed("type UNKNOWN on the wire"));
        }
        let stored = u16::from_be_bytes([bytes[CHECKSUM_OFFSET], bytes[CHECKSUM_OFFSET + 1]]);
        if compute_checksum(bytes) != stored {
            return Err(PacketError::Malformed("checksum mismatch"));
        }
        Ok(Self { kind: ty, buf: bytes.to_vec() })
    }

    /// Classifies a DIGI-framed blob as DATA_FROM_RSN without reframing it.
    ///
    /// The checksum is re-verified but never regenerated, and a mismatch does
    /// not reject the packet; the upstream framing is treated as opaque.
    pub fn from_rsn(bytes: &[u8]) -> Result<Self, PacketError> {
        validate_frame(bytes)?;
        let stored = u16::from_be_bytes([bytes[CHECKSUM_OFFSET], bytes[CHECKSUM_OFFSET + 1]]);
        if compute_checksum(bytes) != stored {
            warn!(stored, "rsn packet checksum mismatch, forwarding anyway");
        }
        Ok(Self { kind: PacketType::DataFromRsn, buf: bytes.to_vec() })
    }

    #[inline]
    pub fn packet_type(&self) -> PacketType {
        self.kind
    }

    /// Raw type byte at header offset 3; differs from `packet_type()` only
    /// for RSN blobs.
    #[inline]
    pub fn header_type(&self) -> u8 {
        self.buf[TYPE_OFFSET]
    }

    #[inline]
    pub fn packet_size(&self) -> u16 {
        u16::from_be_bytes([self.buf[SIZE_OFFSET], self.buf[SIZE_OFFSET + 1]])
    }

    #[inline]
    pub fn checksum(&self) -> u16 {
        u16::from_be_bytes([self.buf[CHECKSUM_OFFSET], self.buf[CHECKSUM_OFFSET + 1]])
    }

    #[inline]
    pub fn timestamp(&self) -> NtpTimestamp {
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&self.buf[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 8]);
        NtpTimestamp::from_be_bytes(ts)
    }

    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    #[inline]
    pub fn to_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Log projection: payload bytes inside a tagged line.
    pub fn ascii(&self) -> String {
        format!(
            "<port_agent_packet type=\"{}\" time=\"{}\">{}</port_agent_packet>\r\n",
            self.kind.name(),
            self.timestamp(),
            String::from_utf8_lossy(self.payload()),
        )
    }

    /// Multi-line human dump with the payload in hex.
    pub fn pretty(&self) -> String {
        let mut out = format!(
            "type: {}\nsize: {}\nchecksum: 0x{:04x}\ntime: {}\npayload:",
            self.kind.name(),
            self.packet_size(),
            self.checksum(),
            self.timestamp(),
        );
        for (i, b) in self.payload().iter().enumerate() {
            if i % 16 == 0 {
                out.push('\n');
            }
            out.push_str(&format!("{b:02x} "));
        }
        out.push('\n');
        out
    }
}

fn validate_frame(bytes: &[u8]) -> Result<(), PacketError> {
    if bytes.len() < HEADER_SIZE {
        return Err(PacketError::Malformed("short frame"));
    }
    if bytes[..3] != SYNC {
        return Err(PacketError::Malformed("bad sync"));
    }
    let size = u16::from_be_bytes([bytes[SIZE_OFFSET], bytes[SIZE_OFFSET + 1]]) as usize;
    if size != bytes.len() {
        return Err(PacketError::Malformed("size field disagrees with frame length"));
    }
    Ok(())
}

/// 16-bit XOR over every byte of the frame with the checksum field treated
/// as zero.
fn compute_checksum(buf: &[u8]) -> u16 {
    let mut c = 0u16;
    for (i, b) in buf.iter().enumerate() {
        if i == CHECKSUM_OFFSET || i == CHECKSUM_OFFSET + 1 {
            continue;
        }
        c ^= *b as u16;
    }
    c
}
