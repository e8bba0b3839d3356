//! Typed payload (de)serializers for the eleven packet kinds.
//!
//! Binary payloads (METADATA, VIDEO_CONFIG S→C, VIDEO_DATA, AUDIO_CONFIG,
//! AUDIO_DATA, HEARTBEAT, ERROR_MESSAGE, CONNECTION_ACK) use explicit
//! big-endian integer encoding. CONTROL_EVENT, VIDEO_CONFIG C→S, and
//! COMMAND_REQUEST carry JSON bodies alongside a small binary envelope.

use serde::{Deserialize, Serialize};

use crate::error::PacketError;

fn need(buf: &[u8], len: usize) -> Result<(), PacketError> {
    if buf.len() < len {
        return Err(PacketError::IncompletePayload {
            expected: len,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// `METADATA` (0x01, S→C).
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataPayload {
    pub model: String,
    pub manufacturer: String,
    pub android_version: String,
    pub api_level: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    pub screen_density: u32,
    pub video_codec: String,
    pub audio_codec: String,
    pub video_bitrate_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub fps: u32,
    pub audio_sample_rate: u32,
    pub audio_channels: u32,
}

impl MetadataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_str(&mut buf, &self.model);
        encode_str(&mut buf, &self.manufacturer);
        encode_str(&mut buf, &self.android_version);
        buf.extend_from_slice(&self.api_level.to_be_bytes());
        buf.extend_from_slice(&self.screen_width.to_be_bytes());
        buf.extend_from_slice(&self.screen_height.to_be_bytes());
        buf.extend_from_slice(&self.screen_density.to_be_bytes());
        encode_str(&mut buf, &self.video_codec);
        encode_str(&mut buf, &self.audio_codec);
        buf.extend_from_slice(&self.video_bitrate_kbps.to_be_bytes());
        buf.extend_from_slice(&self.audio_bitrate_kbps.to_be_bytes());
        buf.extend_from_slice(&self.fps.to_be_bytes());
        buf.extend_from_slice(&self.audio_sample_rate.to_be_bytes());
        buf.extend_from_slice(&self.audio_channels.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let model = decode_str(&mut cur)?;
        let manufacturer = decode_str(&mut cur)?;
        let android_version = decode_str(&mut cur)?;
        let api_level = take_u32(&mut cur)?;
        let screen_width = take_u32(&mut cur)?;
        let screen_height = take_u32(&mut cur)?;
        let screen_density = take_u32(&mut cur)?;
        let video_codec = decode_str(&mut cur)?;
        let audio_codec = decode_str(&mut cur)?;
        let video_bitrate_kbps = take_u32(&mut cur)?;
        let audio_bitrate_kbps = take_u32(&mut cur)?;
        let fps = take_u32(&mut cur)?;
        let audio_sample_rate = take_u32(&mut cur)?;
        let audio_channels = take_u32(&mut cur)?;
        Ok(Self {
            model,
            manufacturer,
            android_version,
            api_level,
            screen_width,
            screen_height,
            screen_density,
            video_codec,
            audio_codec,
            video_bitrate_kbps,
            audio_bitrate_kbps,
            fps,
            audio_sample_rate,
            audio_channels,
        })
    }
}

fn encode_str(buf: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn decode_str(cur: &mut &[u8]) -> Result<String, PacketError> {
    let len = take_u32(cur)? as usize;
    need(cur, len)?;
    let (s, rest) = cur.split_at(len);
    *cur = rest;
    Ok(String::from_utf8_lossy(s).into_owned())
}

fn take_u32(cur: &mut &[u8]) -> Result<u32, PacketError> {
    need(cur, 4)?;
    let (head, rest) = cur.split_at(4);
    *cur = rest;
    Ok(u32::from_be_bytes(head.try_into().unwrap()))
}

fn take_u64(cur: &mut &[u8]) -> Result<u64, PacketError> {
    need(cur, 8)?;
    let (head, rest) = cur.split_at(8);
    *cur = rest;
    Ok(u64::from_be_bytes(head.try_into().unwrap()))
}

/// `VIDEO_CONFIG` (0x02) server→client direction: SPS/PPS blob.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoConfigPayload {
    pub config_data: Vec<u8>,
}

impl VideoConfigPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.config_data.len());
        buf.extend_from_slice(&(self.config_data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.config_data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let len = take_u32(&mut cur)? as usize;
        need(cur, len)?;
        Ok(Self {
            config_data: cur[..len].to_vec(),
        })
    }
}

/// `VIDEO_CONFIG` (0x02) client→server direction: stream start/stop request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum VideoStreamAction {
    StartVideoStream,
    StopVideoStream,
}

impl VideoStreamAction {
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::InvalidJson(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        serde_json::from_slice(buf).map_err(|e| PacketError::InvalidJson(e.to_string()))
    }
}

/// `VIDEO_DATA` (0x03, S→C).
#[derive(Debug, Clone, PartialEq)]
pub struct VideoDataPayload {
    pub pts: u64,
    pub dts: u64,
    pub frame_number: u32,
    pub data: Vec<u8>,
}

impl VideoDataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + 4 + self.data.len());
        buf.extend_from_slice(&self.pts.to_be_bytes());
        buf.extend_from_slice(&self.dts.to_be_bytes());
        buf.extend_from_slice(&self.frame_number.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let pts = take_u64(&mut cur)?;
        let dts = take_u64(&mut cur)?;
        let frame_number = take_u32(&mut cur)?;
        let data_size = take_u32(&mut cur)? as usize;
        need(cur, data_size)?;
        Ok(Self {
            pts,
            dts,
            frame_number,
            data: cur[..data_size].to_vec(),
        })
    }
}

/// `AUDIO_CONFIG` (0x04, S→C). Reserved: audio encode is out of scope, but
/// the wire shape is kept complete so the type table round-trips.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfigPayload {
    pub sample_rate: u32,
    pub channels: u32,
    pub bits_per_sample: u32,
    pub config_data: Vec<u8>,
}

impl AudioConfigPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12 + 4 + self.config_data.len());
        buf.extend_from_slice(&self.sample_rate.to_be_bytes());
        buf.extend_from_slice(&self.channels.to_be_bytes());
        buf.extend_from_slice(&self.bits_per_sample.to_be_bytes());
        buf.extend_from_slice(&(self.config_data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.config_data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let sample_rate = take_u32(&mut cur)?;
        let channels = take_u32(&mut cur)?;
        let bits_per_sample = take_u32(&mut cur)?;
        let len = take_u32(&mut cur)? as usize;
        need(cur, len)?;
        Ok(Self {
            sample_rate,
            channels,
            bits_per_sample,
            config_data: cur[..len].to_vec(),
        })
    }
}

/// `AUDIO_DATA` (0x05, S→C). Reserved, see [`AudioConfigPayload`].
#[derive(Debug, Clone, PartialEq)]
pub struct AudioDataPayload {
    pub pts: u64,
    pub frame_number: u32,
    pub data: Vec<u8>,
}

impl AudioDataPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 + 4 + self.data.len());
        buf.extend_from_slice(&self.pts.to_be_bytes());
        buf.extend_from_slice(&self.frame_number.to_be_bytes());
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let pts = take_u64(&mut cur)?;
        let frame_number = take_u32(&mut cur)?;
        let data_size = take_u32(&mut cur)? as usize;
        need(cur, data_size)?;
        Ok(Self {
            pts,
            frame_number,
            data: cur[..data_size].to_vec(),
        })
    }
}

/// `CONTROL_EVENT` (0x06, C→S): a sub-type tag plus a JSON body.
/// The JSON shape itself lives in [`crate::input_event::ControlEventPayload`].
#[derive(Debug, Clone, PartialEq)]
pub struct ControlEventEnvelope {
    pub sub_type: u8,
    pub data: Vec<u8>,
}

impl ControlEventEnvelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + self.data.len());
        buf.push(self.sub_type);
        buf.extend_from_slice(&(self.data.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        need(buf, 1)?;
        let sub_type = buf[0];
        let mut cur = &buf[1..];
        let data_size = take_u32(&mut cur)? as usize;
        need(cur, data_size)?;
        Ok(Self {
            sub_type,
            data: cur[..data_size].to_vec(),
        })
    }
}

/// `HEARTBEAT` (0x07, both directions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatPayload {
    pub server_time: u64,
    pub connection_id: u32,
}

impl HeartbeatPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.server_time.to_be_bytes());
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let server_time = take_u64(&mut cur)?;
        let connection_id = take_u32(&mut cur)?;
        Ok(Self {
            server_time,
            connection_id,
        })
    }
}

/// `ERROR_MESSAGE` (0x08, both directions).
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessagePayload {
    pub error_code: u32,
    pub message: String,
}

impl ErrorMessagePayload {
    pub fn encode(&self) -> Vec<u8> {
        let bytes = self.message.as_bytes();
        let mut buf = Vec::with_capacity(8 + bytes.len());
        buf.extend_from_slice(&self.error_code.to_be_bytes());
        buf.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        buf.extend_from_slice(bytes);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let error_code = take_u32(&mut cur)?;
        let message = decode_str_with_prefix_len(&mut cur)?;
        Ok(Self { error_code, message })
    }
}

fn decode_str_with_prefix_len(cur: &mut &[u8]) -> Result<String, PacketError> {
    let len = take_u32(cur)? as usize;
    need(cur, len)?;
    let (s, rest) = cur.split_at(len);
    *cur = rest;
    Ok(String::from_utf8_lossy(s).into_owned())
}

/// `CONNECTION_ACK` (0x09, S→C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionAckPayload {
    pub connection_id: u32,
    pub max_packet_size: u32,
    pub buffer_size: u32,
}

impl ConnectionAckPayload {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&self.connection_id.to_be_bytes());
        buf.extend_from_slice(&self.max_packet_size.to_be_bytes());
        buf.extend_from_slice(&self.buffer_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        let mut cur = buf;
        let connection_id = take_u32(&mut cur)?;
        let max_packet_size = take_u32(&mut cur)?;
        let buffer_size = take_u32(&mut cur)?;
        Ok(Self {
            connection_id,
            max_packet_size,
            buffer_size,
        })
    }
}

/// `COMMAND_REQUEST` (0x10, C→S).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequestPayload {
    pub command: String,
}

impl CommandRequestPayload {
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        serde_json::to_vec(self).map_err(|e| PacketError::InvalidJson(e.to_string()))
    }

    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        serde_json::from_slice(buf).map_err(|e| PacketError::InvalidJson(e.to_string()))
    }
}

/// `COMMAND_RESPONSE` (0x11, S→C): plain UTF-8 text. The presence of the
/// substring "error" (case-insensitive) marks the command as failed — there
/// is no separate success/failure field on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponsePayload {
    pub text: String,
}

impl CommandResponsePayload {
    pub fn is_failure(&self) -> bool {
        self.text.to_lowercase().contains("error")
    }

    pub fn encode(&self) -> Vec<u8> {
        self.text.as_bytes().to_vec()
    }

    pub fn decode(buf: &[u8]) -> Self {
        Self {
            text: String::from_utf8_lossy(buf).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_roundtrip() {
        let m = MetadataPayload {
            model: "Pixel 7".into(),
            manufacturer: "Google".into(),
            android_version: "14".into(),
            api_level: 34,
            screen_width: 1080,
            screen_height: 2400,
            screen_density: 420,
            video_codec: "h264".into(),
            audio_codec: "none".into(),
            video_bitrate_kbps: 8000,
            audio_bitrate_kbps: 0,
            fps: 60,
            audio_sample_rate: 0,
            audio_channels: 0,
        };
        let encoded = m.encode();
        let decoded = MetadataPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, m);
    }

    #[test]
    fn video_data_roundtrip() {
        let p = VideoDataPayload {
            pts: 1000,
            dts: 990,
            frame_number: 42,
            data: vec![0, 1, 2, 3, 4],
        };
        let encoded = p.encode();
        let decoded = VideoDataPayload::decode(&encoded).unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn video_data_incomplete_is_rejected() {
        let p = VideoDataPayload {
            pts: 1,
            dts: 1,
            frame_number: 1,
            data: vec![1, 2, 3],
        };
        let mut encoded = p.encode();
        encoded.truncate(encoded.len() - 1);
        assert!(VideoDataPayload::decode(&encoded).is_err());
    }

    #[test]
    fn video_stream_action_json_shape() {
        let encoded = VideoStreamAction::StartVideoStream.encode().unwrap();
        assert_eq!(encoded, br#"{"action":"start_video_stream"}"#);
        let decoded = VideoStreamAction::decode(&encoded).unwrap();
        assert_eq!(decoded, VideoStreamAction::StartVideoStream);
    }

    #[test]
    fn heartbeat_roundtrip() {
        let h = HeartbeatPayload {
            server_time: 123_456_789,
            connection_id: 7,
        };
        let decoded = HeartbeatPayload::decode(&h.encode()).unwrap();
        assert_eq!(decoded, h);
    }

    #[test]
    fn connection_ack_roundtrip() {
        let a = ConnectionAckPayload {
            connection_id: 3,
            max_packet_size: 16 * 1024 * 1024,
            buffer_size: 65536,
        };
        let decoded = ConnectionAckPayload::decode(&a.encode()).unwrap();
        assert_eq!(decoded, a);
    }

    #[test]
    fn error_message_roundtrip() {
        let e = ErrorMessagePayload {
            error_code: 7,
            message: "socket closed".into(),
        };
        let decoded = ErrorMessagePayload::decode(&e.encode()).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn command_response_failure_detection() {
        let ok = CommandResponsePayload::decode(b"OK: launched");
        assert!(!ok.is_failure());
        let fail = CommandResponsePayload::decode(b"Error: package not found");
        assert!(fail.is_failure());
    }

    #[test]
    fn control_event_envelope_roundtrip() {
        let env = ControlEventEnvelope {
            sub_type: 2,
            data: br#"{"x":10,"y":20}"#.to_vec(),
        };
        let decoded = ControlEventEnvelope::decode(&env.encode()).unwrap();
        assert_eq!(decoded, env);
    }
}
