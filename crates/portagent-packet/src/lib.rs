mod buffered;
mod error;
mod packet;
mod splitter;
mod types;

pub use buffered::BufferedPacket;
pub use error::PacketError;
pub use packet::{HEADER_SIZE, MAX_PACKET_SIZE, MAX_PAYLOAD, Packet, SYNC};
pub use splitter::FrameSplitter;
pub use types::{PacketType, TypeFilter};
