//! The active-connection registry: reference-counted client handles and the
//! server-wide statistics counters.
//!
//! A [`ClientHandle`] is shared between the receive-sweep loop and the
//! fan-out send path (spec.md §5, "Connection lifetimes"). Eviction never
//! frees the handle directly — it flips `active` to false and shuts the
//! socket down; the handle itself is dropped once both users release their
//! `Arc`, which is exactly what `Arc`'s reference counting already gives us
//! in place of the teacher's manual pointer + mutex ownership.

use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use uuid::Uuid;

/// One accepted client connection.
pub struct ClientHandle {
    pub connection_id: u32,
    pub address: SocketAddr,
    pub connect_time: Instant,
    stream: Mutex<TcpStream>,
    pub active: AtomicBool,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    /// Cleared once this client's join protocol (metadata + cached config)
    /// has been sent, so the fan-out loop doesn't resend it.
    pub joined: AtomicBool,
    /// Per-connection demux buffer (spec.md §9: "the only stateful parser
    /// bound to a connection"). Exclusive to the receive-sweep loop: only
    /// it appends (from `try_recv`) and only it parses packets out of it.
    pub recv_buffer: Mutex<Vec<u8>>,
    pub requested_video_stream: AtomicBool,
}

impl ClientHandle {
    pub fn new(connection_id: u32, address: SocketAddr, stream: TcpStream) -> Arc<Self> {
        Arc::new(Self {
            connection_id,
            address,
            connect_time: Instant::now(),
            stream: Mutex::new(stream),
            active: AtomicBool::new(true),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            joined: AtomicBool::new(false),
            recv_buffer: Mutex::new(Vec::new()),
            requested_video_stream: AtomicBool::new(false),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Single-attempt write (spec.md §4.5): one `write` call, partial sends
    /// accepted and counted, never retried. On a non-blocking socket a full
    /// kernel send buffer surfaces as `WouldBlock`, which the caller treats
    /// like any other send error and evicts the connection.
    pub fn try_send(&self, bytes: &[u8]) -> std::io::Result<usize> {
        use std::io::Write;
        let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let n = guard.write(bytes)?;
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Non-blocking read into `buf`, used by the receive-sweep loop.
    /// Returns `Ok(0)` on EOF, `Ok(n)` for `n` bytes read, or an IO error
    /// (including `WouldBlock`, which the caller treats as "no data yet").
    pub fn try_recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        use std::io::Read;
        let mut guard = self.stream.lock().unwrap_or_else(|e| e.into_inner());
        let n = guard.read(buf)?;
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Marks the handle inactive and shuts down the socket. Safe to call
    /// more than once; subsequent sends/receives simply observe `active =
    /// false` and are skipped by the fan-out / receive loops.
    pub fn evict(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Ok(guard) = self.stream.lock() {
                let _ = guard.shutdown(std::net::Shutdown::Both);
            }
        }
    }
}

/// Server-wide totals, monotonic except for explicit [`ServerStats::reset`].
#[derive(Default)]
pub struct ServerStats {
    pub total_connections: AtomicU64,
    pub total_bytes_received: AtomicU64,
    pub total_bytes_sent: AtomicU64,
    pub total_frames_encoded: AtomicU64,
    pub total_keyframes: AtomicU64,
    pub dropped_frames: AtomicU64,
}

impl ServerStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> ServerStatsSnapshot {
        ServerStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_frames_encoded: self.total_frames_encoded.load(Ordering::Relaxed),
            total_keyframes: self.total_keyframes.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
        }
    }

    /// Explicit reset, the only way any of these counters move backwards.
    pub fn reset(&self) {
        self.total_connections.store(0, Ordering::Relaxed);
        self.total_bytes_received.store(0, Ordering::Relaxed);
        self.total_bytes_sent.store(0, Ordering::Relaxed);
        self.total_frames_encoded.store(0, Ordering::Relaxed);
        self.total_keyframes.store(0, Ordering::Relaxed);
        self.dropped_frames.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStatsSnapshot {
    pub total_connections: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub total_frames_encoded: u64,
    pub total_keyframes: u64,
    pub dropped_frames: u64,
}

/// Generates the opaque per-connection id handed out in `CONNECTION_ACK`.
pub fn new_connection_id() -> u32 {
    // Low 32 bits of a v4 UUID is plenty of entropy for a process-lifetime id
    // and keeps this consistent with the rest of the codebase's `uuid` usage.
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
