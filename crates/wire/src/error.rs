use thiserror::Error;

pub const HEADER_SIZE: usize = 32;
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer too short: {0} bytes (need at least {HEADER_SIZE})")]
    TooShort(usize),
    #[error("invalid magic: 0x{0:08x} (expected 0x{expected:08x})", expected = super::header::PACKET_MAGIC)]
    InvalidMagic(u32),
    #[error("unsupported version: {0} (expected {expected})", expected = super::header::PROTOCOL_VERSION)]
    UnsupportedVersion(u16),
    #[error("declared length {0} is smaller than the header size ({HEADER_SIZE})")]
    LengthTooSmall(u32),
    #[error("declared length {0} exceeds the maximum packet size ({MAX_PACKET_SIZE})")]
    LengthTooLarge(u32),
    #[error("incomplete payload: expected {expected} bytes, have {actual}")]
    IncompletePayload { expected: usize, actual: usize },
    #[error("malformed JSON payload: {0}")]
    InvalidJson(String),
}

impl PacketError {
    /// Whether this error means "the bytes seen so far are simply incomplete"
    /// as opposed to "the bytes seen so far can never be valid".
    pub fn is_recoverable_by_waiting(&self) -> bool {
        matches!(self, PacketError::TooShort(_) | PacketError::IncompletePayload { .. })
    }
}
