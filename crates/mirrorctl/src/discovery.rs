//! UDP discovery requester (spec.md §4.3/§6.3), grounded in
//! `device_discovery_service.cpp`: broadcast a `DiscoveryRequest` on the
//! discovery port to every broadcast-capable interface plus the
//! all-networks broadcast address, collect `DiscoveryResponse`s into a
//! peer registry, and prune entries that have gone quiet.
//!
//! Interface enumeration uses `if-addrs` in place of Qt's
//! `QNetworkInterface` — the same portable-enumeration role `socket2` plays
//! for socket options the standard library doesn't expose.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirror_wire::{DiscoveryRequest, DiscoveryResponse, Sequence, DISCOVERY_MAGIC, DISCOVERY_PORT};
use tracing::debug;

use crate::error::ClientError;

/// A device seen on the network, with local liveness bookkeeping layered on
/// top of the wire response.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredPeer {
    pub response: DiscoveryResponse,
    pub address: IpAddr,
    pub last_seen_ms: u64,
    pub online: bool,
}

/// Broadcasts requests and collects responses into a shared registry.
/// `broadcast_request`/`poll_once`/`sweep_liveness` are each meant to be
/// driven from their own tick in the controller's discovery thread.
pub struct DiscoveryClient {
    sock: UdpSocket,
    sequence: Sequence,
    peers: Arc<Mutex<HashMap<String, DiscoveredPeer>>>,
}

impl DiscoveryClient {
    pub fn bind() -> Result<Self, ClientError> {
        let sock = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| ClientError::NetworkFailed(format!("bind discovery socket: {e}")))?;
        sock.set_broadcast(true)
            .map_err(|e| ClientError::NetworkFailed(format!("enable broadcast: {e}")))?;
        sock.set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(|e| ClientError::NetworkFailed(format!("set read timeout: {e}")))?;
        Ok(Self {
            sock,
            sequence: Sequence::new(),
            peers: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Sends one `DiscoveryRequest` to every broadcast-capable interface
    /// found by `if-addrs`, plus the limited-broadcast address, on
    /// `discovery_port`.
    pub fn broadcast_request(&self, discovery_port: u16, now_ms: u64) -> Result<(), ClientError> {
        let request = DiscoveryRequest::new(self.sequence.next(), now_ms);
        let body = serde_json::to_vec(&request)
            .map_err(|e| ClientError::NetworkFailed(format!("encode discovery request: {e}")))?;

        let mut targets: Vec<Ipv4Addr> = broadcast_addresses();
        targets.push(Ipv4Addr::new(255, 255, 255, 255));

        for target in targets {
            let dest = SocketAddr::from((target, discovery_port));
            if let Err(e) = self.sock.send_to(&body, dest) {
                debug!(target = %dest, error = %e, "discovery broadcast send failed");
            }
        }
        Ok(())
    }

    /// Services one receive cycle; returns without error on a read timeout.
    /// On success, upserts the responding peer into the registry and
    /// returns it.
    pub fn poll_once(&self, now_ms: u64) -> Result<Option<DiscoveredPeer>, ClientError> {
        let mut buf = [0u8; 2048];
        let (n, peer_addr) = match self.sock.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(None);
            }
            Err(e) => return Err(ClientError::NetworkFailed(format!("discovery recv: {e}"))),
        };

        let response: DiscoveryResponse = match serde_json::from_slice(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, peer = %peer_addr, "ignoring malformed discovery response");
                return Ok(None);
            }
        };
        if response.magic != DISCOVERY_MAGIC {
            debug!(peer = %peer_addr, "ignoring discovery response with mismatched magic");
            return Ok(None);
        }

        let peer = DiscoveredPeer {
            response: response.clone(),
            address: peer_addr.ip(),
            last_seen_ms: now_ms,
            online: true,
        };
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.insert(response.device_id.clone(), peer.clone());
        Ok(Some(peer))
    }

    /// Marks any peer not seen within `timeout_ms` as offline. Entries are
    /// kept (not removed) so a reappearing device's history isn't lost.
    pub fn sweep_liveness(&self, now_ms: u64, timeout_ms: u64) {
        let mut peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        for peer in peers.values_mut() {
            if now_ms.saturating_sub(peer.last_seen_ms) > timeout_ms {
                peer.online = false;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<DiscoveredPeer> {
        let peers = self.peers.lock().unwrap_or_else(|e| e.into_inner());
        peers.values().cloned().collect()
    }
}

/// IPv4 broadcast addresses of every non-loopback interface that reports one.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces,
        Err(e) => {
            debug!(error = %e, "failed to enumerate network interfaces for discovery broadcast");
            return Vec::new();
        }
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            if_addrs::IfAddr::V4(v4) => v4.broadcast,
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(device_id: &str) -> DiscoveryResponse {
        DiscoveryResponse {
            magic: DISCOVERY_MAGIC,
            device_id: device_id.to_string(),
            device_name: "Pixel".into(),
            device_model: "Pixel 7".into(),
            device_manufacturer: "Google".into(),
            android_version: "14".into(),
            api_level: 34,
            screen_width: 1080,
            screen_height: 2400,
            server_port: 8080,
        }
    }

    #[test]
    fn poll_once_upserts_peer_on_valid_response() {
        let requester = DiscoveryClient::bind().unwrap();
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester_addr = requester.sock.local_addr().unwrap();
        let body = serde_json::to_vec(&sample_response("abc123")).unwrap();
        responder.send_to(&body, requester_addr).unwrap();

        let peer = requester.poll_once(1_000).unwrap().expect("peer seen");
        assert_eq!(peer.response.device_id, "abc123");
        assert!(peer.online);
        assert_eq!(requester.snapshot().len(), 1);
    }

    #[test]
    fn poll_once_ignores_mismatched_magic() {
        let requester = DiscoveryClient::bind().unwrap();
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let requester_addr = requester.sock.local_addr().unwrap();
        let mut bad = sample_response("abc");
        bad.magic = 0xDEAD_BEEF;
        let body = serde_json::to_vec(&bad).unwrap();
        responder.send_to(&body, requester_addr).unwrap();

        let peer = requester.poll_once(1_000).unwrap();
        assert!(peer.is_none());
        assert!(requester.snapshot().is_empty());
    }

    #[test]
    fn sweep_liveness_marks_stale_peers_offline() {
        let requester = DiscoveryClient::bind().unwrap();
        {
            let mut peers = requester.peers.lock().unwrap();
            peers.insert(
                "dev1".to_string(),
                DiscoveredPeer {
                    response: sample_response("dev1"),
                    address: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
                    last_seen_ms: 0,
                    online: true,
                },
            );
        }
        requester.sweep_liveness(40_000, 30_000);
        let snap = requester.snapshot();
        assert_eq!(snap.len(), 1);
        assert!(!snap[0].online);
    }

    #[test]
    fn poll_once_times_out_without_error() {
        let requester = DiscoveryClient::bind().unwrap();
        let result = requester.poll_once(0).unwrap();
        assert!(result.is_none());
    }
}
