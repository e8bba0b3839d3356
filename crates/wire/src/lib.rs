//! Wire-format types shared by the streaming server and the controller
//! client: the framed packet header, per-packet-type payload codecs, UDP
//! discovery messages, control-event payloads, and the TOML config shapes
//! both binaries parse.

pub mod config;
pub mod crc;
pub mod discovery;
pub mod error;
pub mod header;
pub mod input_event;
pub mod packets;
pub mod sequence;

pub use config::{ControllerConfig, NetworkConfig, ServerConfig, SessionConfig, VideoConfig};
pub use crc::crc32;
pub use discovery::{DiscoveryRequest, DiscoveryResponse, DISCOVERY_MAGIC, DISCOVERY_PORT};
pub use error::{PacketError, HEADER_SIZE, MAX_PACKET_SIZE};
pub use header::{PacketFlags, PacketHeader, PacketType, PACKET_MAGIC, PROTOCOL_VERSION};
pub use input_event::{map_to_device_coords, ControlEventPayload, InputEventType};
pub use packets::{
    AudioConfigPayload, AudioDataPayload, CommandRequestPayload, CommandResponsePayload, ConnectionAckPayload,
    ControlEventEnvelope, ErrorMessagePayload, HeartbeatPayload, MetadataPayload, VideoConfigPayload,
    VideoDataPayload, VideoStreamAction,
};
pub use sequence::Sequence;

/// Build a header + encoded-payload byte vector ready to write to a socket.
pub fn frame(header: &PacketHeader, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_concatenates_header_and_payload() {
        let header = PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), 4, 0, 0);
        let buf = frame(&header, &[1, 2, 3, 4]);
        assert_eq!(buf.len(), HEADER_SIZE + 4);
        assert_eq!(&buf[HEADER_SIZE..], &[1, 2, 3, 4]);
    }
}
