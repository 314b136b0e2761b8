use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet parameter out of range: {0}")]
    ParamOutOfRange(&'static str),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
