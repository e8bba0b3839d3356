//! UDP discovery datagrams exchanged on port 8081.
//!
//! Unlike the framed TCP protocol, discovery messages are plain JSON objects
//! with no length-prefix — a single datagram is a single message.

use serde::{Deserialize, Serialize};

pub const DISCOVERY_MAGIC: u32 = 0x4144_5343;
pub const DISCOVERY_PORT: u16 = 8081;

fn default_discovery_port() -> u16 {
    DISCOVERY_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "discovery_request")]
pub struct DiscoveryRequest {
    pub magic: u32,
    pub sequence: u32,
    pub timestamp: u64,
    pub message: String,
}

impl DiscoveryRequest {
    pub fn new(sequence: u32, timestamp: u64) -> Self {
        Self {
            magic: DISCOVERY_MAGIC,
            sequence,
            timestamp,
            message: "ANDROID_SERVER_DISCOVERY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "discovery_response")]
pub struct DiscoveryResponse {
    pub magic: u32,
    pub device_id: String,
    pub device_name: String,
    pub device_model: String,
    pub device_manufacturer: String,
    pub android_version: String,
    pub api_level: u32,
    pub screen_width: u32,
    pub screen_height: u32,
    #[serde(default = "default_discovery_port_field")]
    pub server_port: u16,
}

fn default_discovery_port_field() -> u16 {
    8080
}

impl DiscoveryResponse {
    /// Fills in `device_id` from `address:port` when the responder didn't
    /// set one explicitly — per spec this default is applied by the
    /// responder at send time, not by serde at parse time.
    pub fn with_fallback_device_id(mut self, address: &str, port: u16) -> Self {
        if self.device_id.is_empty() {
            self.device_id = format!("{address}:{port}");
        }
        self
    }
}
