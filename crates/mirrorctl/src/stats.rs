//! Per-connection client statistics (spec.md §4.11): atomics for counters
//! touched by more than one thread (the demux/heartbeat threads write,
//! the UI/aggregation reads), a mutex-guarded snapshot when several values
//! must be read together — the same split the server side uses for
//! `ServerStats`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
pub struct ClientStats {
    pub frame_count: AtomicU64,
    pub error_count: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    /// Milliseconds since `UNIX_EPOCH`, updated on every `HEARTBEAT` seen.
    pub last_heartbeat_ms: AtomicU64,
    /// `current_fps` changes together with a reset of its sampling window,
    /// so it is mutex-guarded rather than a bare atomic.
    current_fps: Mutex<f64>,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_current_fps(&self, fps: f64) {
        *self.current_fps.lock().unwrap_or_else(|e| e.into_inner()) = fps;
    }

    pub fn snapshot(&self) -> ClientStatsSnapshot {
        ClientStatsSnapshot {
            frame_count: self.frame_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            last_heartbeat_ms: self.last_heartbeat_ms.load(Ordering::Relaxed),
            current_fps: *self.current_fps.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientStatsSnapshot {
    pub frame_count: u64,
    pub error_count: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub last_heartbeat_ms: u64,
    pub current_fps: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counter_updates() {
        let stats = ClientStats::new();
        stats.frame_count.fetch_add(3, Ordering::Relaxed);
        stats.bytes_received.fetch_add(128, Ordering::Relaxed);
        stats.set_current_fps(29.97);
        let snap = stats.snapshot();
        assert_eq!(snap.frame_count, 3);
        assert_eq!(snap.bytes_received, 128);
        assert!((snap.current_fps - 29.97).abs() < f64::EPSILON);
    }
}
