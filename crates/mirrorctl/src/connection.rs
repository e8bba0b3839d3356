//! Per-device client connection (spec.md §4.7): streaming state machine,
//! framed demux loop, dispatch table, heartbeat generation/liveness, and
//! bounded reconnect.
//!
//! Grounded in `native_protocol_client.cpp` for the heartbeat-timer/
//! reconnect-timer shape, and in the teacher's `peer.rs` "shared handle +
//! generation counter" pattern (`peer_gen` in `agent::video`) for detecting
//! a reconnect cleanly: `connection_gen` here plays the same role, letting
//! the demux thread notice it has been superseded by a fresh connect
//! attempt and exit instead of acting on a dead socket.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mirror_wire::{
    frame, CommandRequestPayload, CommandResponsePayload, ConnectionAckPayload, ControlEventEnvelope,
    ControlEventPayload, ErrorMessagePayload, HeartbeatPayload, MetadataPayload, PacketError, PacketFlags,
    PacketHeader, PacketType, Sequence, VideoConfigPayload, VideoDataPayload, VideoStreamAction, HEADER_SIZE,
};
use tracing::{debug, warn};

use crate::decoder::{DecodedImage, DecoderHarness};
use crate::error::ClientError;
use crate::socket::{self, StreamConfig};
use crate::stats::ClientStats;

const LIVENESS_TICK: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Streaming,
    Error,
}

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    Metadata(MetadataPayload),
    Frame(DecodedImage),
    ErrorMessage { code: u32, message: String },
    /// Terminal: reconnect attempts are exhausted for this device.
    StreamingError(String),
}

/// Observer seam for connection lifecycle/decode events (spec.md §9:
/// per-component callback registration in place of the source's
/// UI-framework signal/slot system).
pub trait ConnectionSink: Send + Sync {
    fn on_event(&self, device_id: &str, event: ConnectionEvent);
}

pub struct NullSink;
impl ConnectionSink for NullSink {
    fn on_event(&self, _device_id: &str, _event: ConnectionEvent) {}
}

/// Forwards every event to an `mpsc` channel, tagged with the device id —
/// the shape [`crate::controller::MultiSessionController`] uses to fan
/// per-device events into one aggregation point.
pub struct ChannelSink(pub mpsc::Sender<(String, ConnectionEvent)>);
impl ConnectionSink for ChannelSink {
    fn on_event(&self, device_id: &str, event: ConnectionEvent) {
        let _ = self.0.send((device_id.to_string(), event));
    }
}

pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub stream: StreamConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(10_000),
            heartbeat_interval: Duration::from_millis(5_000),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(3_000),
            stream: StreamConfig::default(),
        }
    }
}

pub struct ClientConnection {
    device_id: String,
    address: SocketAddr,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    stream: Mutex<Option<TcpStream>>,
    sequence: Sequence,
    connection_id: AtomicU32,
    max_packet_size: AtomicU32,
    last_heartbeat_received_ms: AtomicU64,
    reconnect_attempts: AtomicU32,
    running: AtomicBool,
    connection_gen: AtomicU64,
    decoder: Mutex<DecoderHarness>,
    cached_video_config: Mutex<Option<Vec<u8>>>,
    pending_command: Mutex<Option<mpsc::Sender<(bool, String)>>>,
    pub stats: Arc<ClientStats>,
    sink: Arc<dyn ConnectionSink>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ClientConnection {
    pub fn new(
        device_id: String,
        address: SocketAddr,
        config: ConnectionConfig,
        decoder: DecoderHarness,
        sink: Arc<dyn ConnectionSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            device_id,
            address,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            stream: Mutex::new(None),
            sequence: Sequence::new(),
            connection_id: AtomicU32::new(0),
            max_packet_size: AtomicU32::new(0),
            last_heartbeat_received_ms: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            running: AtomicBool::new(false),
            connection_gen: AtomicU64::new(0),
            decoder: Mutex::new(decoder),
            cached_video_config: Mutex::new(None),
            pending_command: Mutex::new(None),
            stats: Arc::new(ClientStats::new()),
            sink,
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
        self.sink.on_event(&self.device_id, ConnectionEvent::StateChanged(state));
    }

    /// Starts the connection's lifecycle thread. Connect attempts, the
    /// framed demux loop, heartbeats, and reconnects all run in the
    /// background; this call returns immediately.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let conn = self.clone();
        let handle = thread::spawn(move || lifecycle_loop(conn));
        self.threads.lock().unwrap_or_else(|e| e.into_inner()).push(handle);
    }

    /// Idempotent: a second call on an already-disconnected connection is a
    /// no-op, matching the spec's `disconnect_from_device` idempotence law.
    pub fn disconnect(&self) {
        self.running.store(false, Ordering::Release);
        self.connection_gen.fetch_add(1, Ordering::AcqRel);
        self.close_stream();
        self.set_state(ConnectionState::Disconnected);
    }

    fn close_stream(&self) {
        if let Some(stream) = self.stream.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Requests the server start or stop the video stream for this
    /// connection. There is no acknowledgment packet for this action on the
    /// wire, so the local state transition is optimistic.
    pub fn request_stream(&self, start: bool) -> Result<(), ClientError> {
        let action = if start { VideoStreamAction::StartVideoStream } else { VideoStreamAction::StopVideoStream };
        let payload = action.encode().map_err(|e| ClientError::ProtocolMismatch(e.to_string()))?;
        self.send_packet(PacketType::VideoConfig, PacketFlags::empty(), &payload)?;
        self.set_state(if start { ConnectionState::Streaming } else { ConnectionState::Connected });
        Ok(())
    }

    pub fn send_control_event(&self, payload: &ControlEventPayload) -> Result<(), ClientError> {
        let envelope = crate::input_event::encode_envelope(payload).map_err(|e| ClientError::ProtocolMismatch(e.to_string()))?;
        self.send_packet(PacketType::ControlEvent, PacketFlags::empty(), &envelope.encode())
    }

    /// Sends a `COMMAND_REQUEST` and blocks for its `COMMAND_RESPONSE`, up
    /// to `timeout`. Only one command may be outstanding at a time.
    pub fn send_command_blocking(&self, command: String, timeout: Duration) -> Result<CommandResponsePayload, ClientError> {
        let (tx, rx) = mpsc::channel();
        {
            let mut slot = self.pending_command.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return Err(ClientError::CommandAlreadyOutstanding);
            }
            *slot = Some(tx);
        }
        let payload = CommandRequestPayload { command }.encode().map_err(|e| ClientError::ProtocolMismatch(e.to_string()))?;
        if let Err(e) = self.send_packet(PacketType::CommandRequest, PacketFlags::empty(), &payload) {
            self.pending_command.lock().unwrap_or_else(|e| e.into_inner()).take();
            return Err(e);
        }
        match rx.recv_timeout(timeout) {
            Ok((success, text)) => Ok(CommandResponsePayload { text: if success { text } else { format!("error: {text}") } }),
            Err(_) => {
                self.pending_command.lock().unwrap_or_else(|e| e.into_inner()).take();
                Err(ClientError::CommandTimedOut)
            }
        }
    }

    fn send_packet(&self, packet_type: PacketType, flags: PacketFlags, payload: &[u8]) -> Result<(), ClientError> {
        let header = PacketHeader::new(packet_type, flags, payload.len() as u32, now_ns(), self.sequence.next());
        let bytes = frame(&header, payload);
        let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let Some(stream) = guard.as_mut() else {
            return Err(ClientError::NotConnected);
        };
        stream.write_all(&bytes).map_err(|e| ClientError::NetworkFailed(e.to_string()))?;
        self.stats.bytes_sent.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn dispatch(&self, header: &PacketHeader, payload: &[u8]) {
        match header.packet_type {
            PacketType::Metadata => match MetadataPayload::decode(payload) {
                Ok(metadata) => self.sink.on_event(&self.device_id, ConnectionEvent::Metadata(metadata)),
                Err(e) => debug!(error = %e, "malformed METADATA payload"),
            },
            PacketType::VideoConfig => match VideoConfigPayload::decode(payload) {
                Ok(config) => {
                    let already_streaming = self.state() == ConnectionState::Streaming;
                    *self.cached_video_config.lock().unwrap_or_else(|e| e.into_inner()) = Some(config.config_data.clone());
                    if !already_streaming {
                        self.decoder.lock().unwrap_or_else(|e| e.into_inner()).prime(&config.config_data);
                    }
                }
                Err(e) => debug!(error = %e, "malformed VIDEO_CONFIG payload"),
            },
            PacketType::VideoData => match VideoDataPayload::decode(payload) {
                Ok(data) => self.handle_video_data(header, data),
                Err(e) => debug!(error = %e, "malformed VIDEO_DATA payload"),
            },
            PacketType::ErrorMessage => match ErrorMessagePayload::decode(payload) {
                Ok(err) => self.sink.on_event(
                    &self.device_id,
                    ConnectionEvent::ErrorMessage { code: err.error_code, message: err.message },
                ),
                Err(e) => debug!(error = %e, "malformed ERROR_MESSAGE payload"),
            },
            PacketType::Heartbeat => match HeartbeatPayload::decode(payload) {
                Ok(_) => self.last_heartbeat_received_ms.store(now_ms(), Ordering::Relaxed),
                Err(e) => debug!(error = %e, "malformed HEARTBEAT payload"),
            },
            PacketType::ConnectionAck => match ConnectionAckPayload::decode(payload) {
                Ok(ack) => {
                    self.connection_id.store(ack.connection_id, Ordering::Relaxed);
                    self.max_packet_size.store(ack.max_packet_size, Ordering::Relaxed);
                }
                Err(e) => debug!(error = %e, "malformed CONNECTION_ACK payload"),
            },
            PacketType::CommandResponse => match CommandResponsePayload::decode(payload) {
                Ok(resp) => {
                    if let Some(tx) = self.pending_command.lock().unwrap_or_else(|e| e.into_inner()).take() {
                        let _ = tx.send((!resp.is_failure(), resp.text));
                    }
                }
                Err(e) => debug!(error = %e, "malformed COMMAND_RESPONSE payload"),
            },
            other => debug!(?other, "received packet type not expected on the client side"),
        }
    }

    fn handle_video_data(&self, header: &PacketHeader, data: VideoDataPayload) {
        let mut decoder = self.decoder.lock().unwrap_or_else(|e| e.into_inner());
        let outcome = decoder.submit(&data.data, header.is_keyframe());
        self.stats.set_current_fps(decoder.stats().average_fps);
        drop(decoder);
        match outcome {
            Ok(Some(image)) => {
                self.stats.frame_count.fetch_add(1, Ordering::Relaxed);
                self.sink.on_event(&self.device_id, ConnectionEvent::Frame(image));
            }
            Ok(None) => {}
            Err(_) => {
                self.stats.error_count.fetch_add(1, Ordering::Relaxed);
                warn!(device_id = %self.device_id, "decoder escalated to terminal state, forcing reconnect");
                self.close_stream();
            }
        }
    }
}

fn lifecycle_loop(conn: Arc<ClientConnection>) {
    loop {
        if !conn.running.load(Ordering::Acquire) {
            conn.set_state(ConnectionState::Disconnected);
            return;
        }
        conn.set_state(ConnectionState::Connecting);

        match socket::connect_with_timeout(conn.address, conn.config.connect_timeout, &conn.config.stream) {
            Ok(stream) => {
                conn.reconnect_attempts.store(0, Ordering::Relaxed);
                let gen = conn.connection_gen.fetch_add(1, Ordering::AcqRel) + 1;
                conn.last_heartbeat_received_ms.store(now_ms(), Ordering::Relaxed);

                let read_stream = match stream.try_clone() {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(device_id = %conn.device_id, error = %e, "failed to clone stream for demux thread");
                        conn.set_state(ConnectionState::Error);
                        if !back_off_or_give_up(&conn) {
                            return;
                        }
                        continue;
                    }
                };
                *conn.stream.lock().unwrap_or_else(|e| e.into_inner()) = Some(stream);
                conn.set_state(ConnectionState::Connected);

                let demux_conn = conn.clone();
                let demux_handle = thread::spawn(move || demux_loop(demux_conn, read_stream, gen));
                conn.threads.lock().unwrap_or_else(|e| e.into_inner()).push(demux_handle);

                run_heartbeat_and_liveness(&conn, gen);
                conn.close_stream();

                if conn.running.load(Ordering::Acquire) {
                    conn.set_state(ConnectionState::Error);
                }
            }
            Err(e) => {
                debug!(device_id = %conn.device_id, error = %e, "connect attempt failed");
                conn.set_state(ConnectionState::Error);
            }
        }

        if !back_off_or_give_up(&conn) {
            return;
        }
    }
}

/// Applies the reconnect policy after a connect failure or a broken
/// connection: sleeps `reconnect_delay` and returns `true` to retry, or
/// marks the connection terminally stopped and returns `false` once
/// `max_reconnect_attempts` is exceeded.
fn back_off_or_give_up(conn: &Arc<ClientConnection>) -> bool {
    if !conn.running.load(Ordering::Acquire) {
        conn.set_state(ConnectionState::Disconnected);
        return false;
    }
    let attempts = conn.reconnect_attempts.fetch_add(1, Ordering::AcqRel) + 1;
    if attempts >= conn.config.max_reconnect_attempts {
        conn.running.store(false, Ordering::Release);
        conn.set_state(ConnectionState::Disconnected);
        conn.sink.on_event(
            &conn.device_id,
            ConnectionEvent::StreamingError("reconnect attempts exhausted".to_string()),
        );
        return false;
    }
    thread::sleep(conn.config.reconnect_delay);
    true
}

fn run_heartbeat_and_liveness(conn: &Arc<ClientConnection>, gen: u64) {
    let mut since_last_heartbeat_sent = Duration::ZERO;
    loop {
        if !conn.running.load(Ordering::Acquire) {
            return;
        }
        if conn.connection_gen.load(Ordering::Acquire) != gen {
            return;
        }
        thread::sleep(LIVENESS_TICK);
        since_last_heartbeat_sent += LIVENESS_TICK;

        if since_last_heartbeat_sent >= conn.config.heartbeat_interval {
            since_last_heartbeat_sent = Duration::ZERO;
            let payload = HeartbeatPayload { server_time: now_ns(), connection_id: conn.connection_id.load(Ordering::Relaxed) }.encode();
            if conn.send_packet(PacketType::Heartbeat, PacketFlags::empty(), &payload).is_err() {
                return;
            }
        }

        let last_heartbeat = conn.last_heartbeat_received_ms.load(Ordering::Relaxed);
        let dead_after = 2 * conn.config.heartbeat_interval;
        if now_ms().saturating_sub(last_heartbeat) > dead_after.as_millis() as u64 {
            warn!(device_id = %conn.device_id, "no inbound traffic within 2x heartbeat interval, treating connection as dead");
            return;
        }
    }
}

fn demux_loop(conn: Arc<ClientConnection>, mut stream: TcpStream, gen: u64) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        if conn.connection_gen.load(Ordering::Acquire) != gen || !conn.running.load(Ordering::Acquire) {
            return;
        }
        let n = match stream.read(&mut chunk) {
            Ok(0) => return,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
            Err(_) => return,
        };
        conn.stats.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        buf.extend_from_slice(&chunk[..n]);

        loop {
            if buf.len() < HEADER_SIZE {
                break;
            }
            match PacketHeader::decode(&buf[..HEADER_SIZE]) {
                Ok(header) => match header.validate_complete(&buf) {
                    Ok(()) => {
                        let total = header.length as usize;
                        let payload = buf[HEADER_SIZE..total].to_vec();
                        buf.drain(..total);
                        conn.dispatch(&header, &payload);
                    }
                    Err(_) => break, // wait for more bytes
                },
                Err(PacketError::InvalidMagic(_)) | Err(PacketError::UnsupportedVersion(_)) => {
                    warn!(device_id = %conn.device_id, "dropping demux buffer after invalid header");
                    buf.clear();
                }
                Err(_) => {
                    buf.clear();
                }
            }
        }
    }
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{DecoderHarness, SyntheticDecoder, TargetGeometry};
    use mirror_wire::PacketType;
    use std::net::TcpListener;
    use std::sync::mpsc::channel;

    fn harness() -> DecoderHarness {
        DecoderHarness::new(Box::new(SyntheticDecoder::new(16, 16)), TargetGeometry::default(), false)
    }

    #[test]
    fn reconnect_budget_exhausts_after_configured_attempts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener); // closed port: every connect attempt fails immediately

        let (tx, rx) = channel();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(200),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_millis(100),
            stream: StreamConfig::default(),
        };
        let conn = ClientConnection::new("dev1".to_string(), addr, config, harness(), Arc::new(ChannelSink(tx)));
        conn.start();

        let mut saw_streaming_error = false;
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if let Ok((_, ConnectionEvent::StreamingError(_))) = rx.recv_timeout(Duration::from_millis(500)) {
                saw_streaming_error = true;
                break;
            }
        }
        assert!(saw_streaming_error, "expected a terminal StreamingError after exhausting reconnect attempts");
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(
            conn.reconnect_attempts.load(Ordering::Relaxed),
            3,
            "max_reconnect_attempts=3 should yield exactly 3 connect attempts, not 4"
        );
    }

    #[test]
    fn handshake_dispatches_metadata_then_config_then_keyframe() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = channel();
        let conn = ClientConnection::new(
            "dev1".to_string(),
            addr,
            ConnectionConfig { heartbeat_interval: Duration::from_secs(60), ..ConnectionConfig::default() },
            harness(),
            Arc::new(ChannelSink(tx)),
        );
        conn.start();

        let (mut server_side, _peer) = listener.accept().unwrap();
        let seq = Sequence::new();
        let metadata = sample_metadata();
        let metadata_bytes = metadata.encode();
        let header = PacketHeader::new(PacketType::Metadata, PacketFlags::empty(), metadata_bytes.len() as u32, 0, seq.next());
        server_side.write_all(&frame(&header, &metadata_bytes)).unwrap();

        let config_bytes = VideoConfigPayload { config_data: vec![0x67, 0x42] }.encode();
        let header = PacketHeader::new(PacketType::VideoConfig, PacketFlags::CONFIG_PACKET, config_bytes.len() as u32, 0, seq.next());
        server_side.write_all(&frame(&header, &config_bytes)).unwrap();

        let video_bytes = VideoDataPayload { pts: 1, dts: 1, frame_number: 1, data: vec![1, 2, 3] }.encode();
        let header = PacketHeader::new(PacketType::VideoData, PacketFlags::KEYFRAME, video_bytes.len() as u32, 0, seq.next());
        server_side.write_all(&frame(&header, &video_bytes)).unwrap();

        let mut saw_metadata = false;
        let mut saw_frame = false;
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline && !(saw_metadata && saw_frame) {
            if let Ok((_, event)) = rx.recv_timeout(Duration::from_millis(500)) {
                match event {
                    ConnectionEvent::Metadata(_) => saw_metadata = true,
                    ConnectionEvent::Frame(_) => saw_frame = true,
                    _ => {}
                }
            }
        }
        assert!(saw_metadata);
        assert!(saw_frame);
        conn.disconnect();
    }

    #[test]
    fn decoded_frames_propagate_fps_into_client_stats() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = ClientConnection::new("dev1".to_string(), addr, ConnectionConfig::default(), harness(), Arc::new(NullSink));

        let header = PacketHeader::new(PacketType::VideoData, PacketFlags::KEYFRAME, 3, 0, 0);
        for _ in 0..crate::decoder::STATS_UPDATE_INTERVAL_FRAMES {
            conn.handle_video_data(&header, VideoDataPayload { pts: 0, dts: 0, frame_number: 0, data: vec![1, 2, 3] });
        }

        assert!(
            conn.stats.snapshot().current_fps > 0.0,
            "decoder's average_fps should be pushed into ClientStats after a full stats window"
        );
    }

    #[test]
    fn disconnect_is_idempotent() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let conn = ClientConnection::new("dev1".to_string(), addr, ConnectionConfig::default(), harness(), Arc::new(NullSink));
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    fn sample_metadata() -> MetadataPayload {
        MetadataPayload {
            model: "Pixel".into(),
            manufacturer: "Google".into(),
            android_version: "14".into(),
            api_level: 34,
            screen_width: 1080,
            screen_height: 2400,
            screen_density: 420,
            video_codec: "h264".into(),
            audio_codec: "none".into(),
            video_bitrate_kbps: 4000,
            audio_bitrate_kbps: 0,
            fps: 30,
            audio_sample_rate: 0,
            audio_channels: 0,
        }
    }
}
