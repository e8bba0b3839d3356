//! UDP discovery responder: listens for `DiscoveryRequest` broadcasts and
//! answers with a `DiscoveryResponse` describing this device and the
//! streaming port it's listening on.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use mirror_wire::{DiscoveryRequest, DiscoveryResponse, DISCOVERY_MAGIC};
use tracing::{debug, warn};

use crate::error::ServerError;

pub struct DiscoveryResponder {
    sock: UdpSocket,
    response_template: DiscoveryResponse,
}

impl DiscoveryResponder {
    pub fn bind(port: u16, response_template: DiscoveryResponse) -> Result<Self, ServerError> {
        let sock = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|e| ServerError::NetworkFailed(format!("bind discovery socket: {e}")))?;
        sock.set_broadcast(true)
            .map_err(|e| ServerError::NetworkFailed(format!("enable broadcast: {e}")))?;
        sock.set_read_timeout(Some(Duration::from_millis(500)))
            .map_err(|e| ServerError::NetworkFailed(format!("set read timeout: {e}")))?;
        Ok(Self { sock, response_template })
    }

    /// Services one receive/reply cycle, returning without error on a
    /// read timeout so the caller's loop can check a shutdown flag.
    pub fn poll_once(&self) -> Result<(), ServerError> {
        let mut buf = [0u8; 1024];
        let (n, peer) = match self.sock.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                return Ok(());
            }
            Err(e) => return Err(ServerError::NetworkFailed(format!("discovery recv: {e}"))),
        };

        let request: DiscoveryRequest = match serde_json::from_slice(&buf[..n]) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, peer = %peer, "ignoring malformed discovery datagram");
                return Ok(());
            }
        };
        if request.magic != DISCOVERY_MAGIC {
            debug!(peer = %peer, "ignoring discovery datagram with mismatched magic");
            return Ok(());
        }

        let response = self
            .response_template
            .clone()
            .with_fallback_device_id(&peer.ip().to_string(), self.response_template.server_port);

        let body = serde_json::to_vec(&response)
            .map_err(|e| ServerError::NetworkFailed(format!("encode discovery response: {e}")))?;
        self.reply_to(&body, peer)
    }

    fn reply_to(&self, body: &[u8], peer: SocketAddr) -> Result<(), ServerError> {
        match self.sock.send_to(body, peer) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to send discovery response");
                Ok(())
            }
        }
    }
}
