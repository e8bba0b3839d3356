use crate::error::{HEADER_SIZE, MAX_PACKET_SIZE, PacketError};

pub const PACKET_MAGIC: u32 = 0x5343_5250;
pub const PROTOCOL_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Metadata = 0x01,
    VideoConfig = 0x02,
    VideoData = 0x03,
    AudioConfig = 0x04,
    AudioData = 0x05,
    ControlEvent = 0x06,
    Heartbeat = 0x07,
    ErrorMessage = 0x08,
    ConnectionAck = 0x09,
    CommandRequest = 0x10,
    CommandResponse = 0x11,
}

impl PacketType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => Self::Metadata,
            0x02 => Self::VideoConfig,
            0x03 => Self::VideoData,
            0x04 => Self::AudioConfig,
            0x05 => Self::AudioData,
            0x06 => Self::ControlEvent,
            0x07 => Self::Heartbeat,
            0x08 => Self::ErrorMessage,
            0x09 => Self::ConnectionAck,
            0x10 => Self::CommandRequest,
            0x11 => Self::CommandResponse,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PacketFlags: u8 {
        const KEYFRAME      = 0x01;
        const CONFIG_PACKET = 0x02;
        const END_OF_STREAM = 0x04;
        const ENCRYPTED     = 0x08;
    }
}

/// The fixed 32-octet packet header. On the wire every multi-byte field is
/// big-endian. `crc32` is always written as zero by [`PacketHeader::encode`];
/// the last 4 bytes are reserved and must round-trip as zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub length: u32,
    pub timestamp: u64,
    pub sequence: u32,
    pub crc32: u32,
}

impl PacketHeader {
    pub fn new(packet_type: PacketType, flags: PacketFlags, payload_len: u32, timestamp: u64, sequence: u32) -> Self {
        Self {
            packet_type,
            flags,
            length: HEADER_SIZE as u32 + payload_len,
            timestamp,
            sequence,
            crc32: 0,
        }
    }

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(PacketFlags::KEYFRAME)
    }

    pub fn is_config(&self) -> bool {
        self.flags.contains(PacketFlags::CONFIG_PACKET)
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }

    /// Serialize the header into a fresh 32-byte buffer.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&PACKET_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        buf[6] = self.packet_type as u8;
        buf[7] = self.flags.bits();
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        buf[12..20].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[20..24].copy_from_slice(&self.sequence.to_be_bytes());
        // crc32 (24..28) and reserved (28..32) stay zero.
        buf
    }

    /// Decode a 32-byte header. Does not look at the payload.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_SIZE {
            return Err(PacketError::TooShort(buf.len()));
        }

        let magic = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if magic != PACKET_MAGIC {
            return Err(PacketError::InvalidMagic(magic));
        }

        let version = u16::from_be_bytes(buf[4..6].try_into().unwrap());
        if version != PROTOCOL_VERSION {
            return Err(PacketError::UnsupportedVersion(version));
        }

        let packet_type = PacketType::from_u8(buf[6]).ok_or(PacketError::InvalidMagic(magic))?;
        let flags = PacketFlags::from_bits_truncate(buf[7]);
        let length = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        if length < HEADER_SIZE as u32 {
            return Err(PacketError::LengthTooSmall(length));
        }
        if length as usize > MAX_PACKET_SIZE {
            return Err(PacketError::LengthTooLarge(length));
        }
        let timestamp = u64::from_be_bytes(buf[12..20].try_into().unwrap());
        let sequence = u32::from_be_bytes(buf[20..24].try_into().unwrap());
        let crc32 = u32::from_be_bytes(buf[24..28].try_into().unwrap());

        Ok(Self {
            packet_type,
            flags,
            length,
            timestamp,
            sequence,
            crc32,
        })
    }

    /// Check that `buf` holds a complete packet (header + payload) per this
    /// header's declared `length`.
    pub fn validate_complete(&self, buf: &[u8]) -> Result<(), PacketError> {
        if buf.len() < self.length as usize {
            return Err(PacketError::IncompletePayload {
                expected: self.payload_len(),
                actual: buf.len().saturating_sub(HEADER_SIZE),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_32() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn roundtrip() {
        let header = PacketHeader::new(PacketType::VideoData, PacketFlags::KEYFRAME, 100, 123_456_789, 7);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_SIZE);
        let decoded = PacketHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.packet_type, PacketType::VideoData);
        assert!(decoded.is_keyframe());
        assert_eq!(decoded.length, 132);
        assert_eq!(decoded.timestamp, 123_456_789);
        assert_eq!(decoded.sequence, 7);
        assert_eq!(decoded.crc32, 0);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = PacketHeader::new(PacketType::Metadata, PacketFlags::empty(), 0, 0, 0).encode();
        buf[0] = 0xDE;
        buf[1] = 0xAD;
        buf[2] = 0xBE;
        buf[3] = 0xEF;
        assert_eq!(PacketHeader::decode(&buf), Err(PacketError::InvalidMagic(0xDEAD_BEEF)));
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = PacketHeader::new(PacketType::Metadata, PacketFlags::empty(), 0, 0, 0).encode();
        buf[4] = 0;
        buf[5] = 99;
        assert_eq!(PacketHeader::decode(&buf), Err(PacketError::UnsupportedVersion(99)));
    }

    #[test]
    fn rejects_too_short() {
        let buf = [0u8; 10];
        assert_eq!(PacketHeader::decode(&buf), Err(PacketError::TooShort(10)));
    }

    #[test]
    fn length_32_means_empty_payload() {
        let header = PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), 0, 0, 0);
        assert_eq!(header.length, 32);
        assert_eq!(header.payload_len(), 0);
        assert!(header.validate_complete(&[0u8; 32]).is_ok());
    }

    #[test]
    fn length_33_waits_for_one_more_byte() {
        let header = PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), 1, 0, 0);
        assert_eq!(header.length, 33);
        // Only the 32-byte header is buffered so far.
        match header.validate_complete(&[0u8; 32]) {
            Err(PacketError::IncompletePayload { expected: 1, actual: 0 }) => {}
            other => panic!("expected IncompletePayload, got {other:?}"),
        }
    }

    #[test]
    fn sequence_increases_across_headers() {
        let a = PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), 0, 0, 5);
        let b = PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), 0, 0, 6);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn length_exceeding_max_is_rejected() {
        let mut header = PacketHeader::new(PacketType::VideoData, PacketFlags::empty(), 0, 0, 0);
        header.length = MAX_PACKET_SIZE as u32 + 1;
        let buf = header.encode();
        assert_eq!(
            PacketHeader::decode(&buf),
            Err(PacketError::LengthTooLarge(MAX_PACKET_SIZE as u32 + 1))
        );
    }
}
