//! The fan-out hub (spec.md §4.5): one encoder output, N client sockets.
//!
//! Send strategy is a single-attempt synchronous write per client; any
//! error evicts that client only, and the remaining clients are unaffected
//! ("no cross-connection ordering guarantee" — spec.md §5). The join
//! protocol (metadata, then cached config, then video data) is driven by
//! [`FanoutHub::add_client`] followed by `flush_join` the first time the
//! owning session pumps an already-joined client through `broadcast`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use mirror_wire::{
    MetadataPayload, PacketFlags, PacketHeader, PacketType, Sequence, VideoConfigPayload, frame,
};
use tracing::{debug, warn};

use crate::registry::{ClientHandle, ServerStats};

/// Everything a newly-joined client needs before live video: who the device
/// is, and the codec config cached from the most recent `VIDEO_CONFIG` unit.
pub struct JoinMaterial {
    pub metadata: MetadataPayload,
    pub cached_config: Option<Vec<u8>>,
}

pub struct FanoutHub {
    clients: Mutex<HashMap<u32, Arc<ClientHandle>>>,
    sequence: Sequence,
    stats: Arc<ServerStats>,
}

impl FanoutHub {
    pub fn new(stats: Arc<ServerStats>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            sequence: Sequence::new(),
            stats,
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Active clients, for the receive-sweep loop's per-sweep iteration.
    pub fn snapshot(&self) -> Vec<Arc<ClientHandle>> {
        let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.values().filter(|c| c.is_active()).cloned().collect()
    }

    /// Registers a new client and immediately sends the join sequence:
    /// metadata, then the cached config packet if one exists. The caller is
    /// responsible for requesting a keyframe afterward so this client's
    /// first picture arrives within one GOP (spec.md §4.5).
    pub fn add_client(&self, handle: Arc<ClientHandle>, join: &JoinMaterial) {
        self.stats.total_connections.fetch_add(1, Ordering::Relaxed);

        let metadata_bytes = join.metadata.encode();
        let header = PacketHeader::new(
            PacketType::Metadata,
            PacketFlags::empty(),
            metadata_bytes.len() as u32,
            now_ns(),
            self.sequence.next(),
        );
        if self.send_one(&handle, &frame(&header, &metadata_bytes)).is_err() {
            return;
        }

        if let Some(config) = &join.cached_config {
            let payload = VideoConfigPayload { config_data: config.clone() }.encode();
            let header = PacketHeader::new(
                PacketType::VideoConfig,
                PacketFlags::CONFIG_PACKET,
                payload.len() as u32,
                now_ns(),
                self.sequence.next(),
            );
            if self.send_one(&handle, &frame(&header, &payload)).is_err() {
                return;
            }
        }

        handle.joined.store(true, Ordering::Release);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.insert(handle.connection_id, handle);
    }

    pub fn remove(&self, connection_id: u32) {
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = clients.remove(&connection_id) {
            handle.evict();
        }
    }

    /// Delivers one encoded unit (already typed video-config or video-data)
    /// to every active client. Clients that error out are evicted; delivery
    /// to the rest continues uninterrupted.
    pub fn broadcast_video(&self, payload_kind: VideoPayload) {
        let snapshot: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.values().filter(|c| c.is_active()).cloned().collect()
        };

        let (packet_type, flags, payload) = match &payload_kind {
            VideoPayload::Config(bytes) => (
                PacketType::VideoConfig,
                PacketFlags::CONFIG_PACKET,
                VideoConfigPayload { config_data: bytes.clone() }.encode(),
            ),
            VideoPayload::Data { payload, is_keyframe } => {
                let mut flags = PacketFlags::empty();
                if *is_keyframe {
                    flags |= PacketFlags::KEYFRAME;
                }
                (PacketType::VideoData, flags, payload.encode())
            }
        };

        let header = PacketHeader::new(packet_type, flags, payload.len() as u32, now_ns(), self.sequence.next());
        let bytes = frame(&header, &payload);

        let mut evicted = Vec::new();
        for client in &snapshot {
            if self.send_one(client, &bytes).is_err() {
                evicted.push(client.connection_id);
            }
        }
        for id in evicted {
            self.remove(id);
        }
    }

    /// Broadcasts a heartbeat to every active client, carrying the server's
    /// monotonic nanoseconds. Participates in the shared sequence counter
    /// but not in stream ordering otherwise (spec.md §4.6).
    pub fn broadcast_heartbeat(&self, server_time_ns: u64) {
        use mirror_wire::HeartbeatPayload;
        let snapshot: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients.values().filter(|c| c.is_active()).cloned().collect()
        };
        for client in &snapshot {
            let payload = HeartbeatPayload {
                server_time: server_time_ns,
                connection_id: client.connection_id,
            }
            .encode();
            let header =
                PacketHeader::new(PacketType::Heartbeat, PacketFlags::empty(), payload.len() as u32, server_time_ns, self.sequence.next());
            if self.send_one(client, &frame(&header, &payload)).is_err() {
                self.remove(client.connection_id);
            }
        }
    }

    /// Sends a pre-framed byte buffer to every active client *except* the one
    /// identified by `exclude`; `exclude = 0` means no exclusion (spec.md
    /// §4.5, "broadcast-except-self").
    pub fn broadcast_except(&self, exclude: u32, bytes: &[u8]) {
        let snapshot: Vec<Arc<ClientHandle>> = {
            let clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            clients
                .values()
                .filter(|c| c.is_active() && (exclude == 0 || c.connection_id != exclude))
                .cloned()
                .collect()
        };
        let mut evicted = Vec::new();
        for client in &snapshot {
            if self.send_one(client, bytes).is_err() {
                evicted.push(client.connection_id);
            }
        }
        for id in evicted {
            self.remove(id);
        }
    }

    fn send_one(&self, client: &ClientHandle, bytes: &[u8]) -> Result<(), ()> {
        match client.try_send(bytes) {
            Ok(n) => {
                self.stats.total_bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                warn!(connection_id = client.connection_id, error = %e, "send failed, evicting client");
                client.evict();
                Err(())
            }
        }
    }
}

pub enum VideoPayload {
    Config(Vec<u8>),
    Data { payload: mirror_wire::VideoDataPayload, is_keyframe: bool },
}

fn now_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_wire::VideoDataPayload;
    use std::net::{TcpListener, TcpStream};

    fn accepted_pair(id: u32) -> (Arc<ClientHandle>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server_side, peer_addr) = listener.accept().unwrap();
        (ClientHandle::new(id, peer_addr, server_side), client)
    }

    fn read_header(stream: &mut TcpStream) -> PacketHeader {
        let mut buf = [0u8; 32];
        std::io::Read::read_exact(stream, &mut buf).unwrap();
        PacketHeader::decode(&buf).unwrap()
    }

    #[test]
    fn join_sends_metadata_then_cached_config() {
        let hub = FanoutHub::new(ServerStats::new());
        let (handle, mut client) = accepted_pair(1);
        let join = JoinMaterial {
            metadata: sample_metadata(),
            cached_config: Some(vec![0x67, 0x42]),
        };
        hub.add_client(handle, &join);

        let first = read_header(&mut client);
        assert_eq!(first.packet_type, PacketType::Metadata);
        let mut meta_payload = vec![0u8; first.payload_len()];
        std::io::Read::read_exact(&mut client, &mut meta_payload).unwrap();

        let second = read_header(&mut client);
        assert_eq!(second.packet_type, PacketType::VideoConfig);
        assert!(second.is_config());
    }

    #[test]
    fn join_without_cached_config_sends_only_metadata() {
        let hub = FanoutHub::new(ServerStats::new());
        let (handle, mut client) = accepted_pair(1);
        let join = JoinMaterial { metadata: sample_metadata(), cached_config: None };
        hub.add_client(handle, &join);

        let first = read_header(&mut client);
        assert_eq!(first.packet_type, PacketType::Metadata);

        client.set_read_timeout(Some(std::time::Duration::from_millis(50))).unwrap();
        let mut probe = [0u8; 1];
        let res = std::io::Read::read(&mut client, &mut probe);
        assert!(res.is_err() || res.unwrap() == 0, "no further packet expected before video data");
    }

    #[test]
    fn send_error_evicts_only_that_client() {
        let hub = FanoutHub::new(ServerStats::new());
        let (h1, c1) = accepted_pair(1);
        let (h2, mut c2) = accepted_pair(2);
        let join = JoinMaterial { metadata: sample_metadata(), cached_config: None };
        hub.add_client(h1, &join);
        hub.add_client(h2, &join);
        drop(c1); // close client 1's end, its next send should fail

        // drain c1's join packet reader side isn't needed since we dropped it
        let mut probe = [0u8; 32];
        let _ = std::io::Read::read(&mut c2, &mut probe);

        hub.broadcast_video(VideoPayload::Data {
            payload: VideoDataPayload { pts: 1, dts: 1, frame_number: 1, data: vec![0; 4096] },
            is_keyframe: true,
        });
        // give the eviction a beat in case the OS buffers the first write
        std::thread::sleep(std::time::Duration::from_millis(50));
        hub.broadcast_video(VideoPayload::Data {
            payload: VideoDataPayload { pts: 2, dts: 2, frame_number: 2, data: vec![0; 4096] },
            is_keyframe: false,
        });
        assert_eq!(hub.client_count(), 1);
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
