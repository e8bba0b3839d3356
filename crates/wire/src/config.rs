use serde::{Deserialize, Serialize};

/// Top-level streaming-server configuration (`mirrorctl-server`), parsed from
/// a TOML file with CLI flags layered on top.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: NetworkConfig::default(),
            video: VideoConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: u32,
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: u32,
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_discovery_liveness_timeout_secs")]
    pub discovery_liveness_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            discovery_port: default_discovery_port(),
            max_connections: default_max_connections(),
            recv_buffer_size: default_buffer_size(),
            send_buffer_size: default_buffer_size(),
            socket_timeout_ms: default_socket_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            discovery_interval_secs: default_discovery_interval_secs(),
            discovery_liveness_timeout_secs: default_discovery_liveness_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_bitrate_kbps")]
    pub bitrate_kbps: u32,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Force a specific encoder: e.g. "nvh264enc", "vah264enc", "x264enc".
    pub encoder: Option<String>,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            bitrate_kbps: default_bitrate_kbps(),
            fps: default_fps(),
            encoder: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_input_queue_capacity")]
    pub input_queue_capacity: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_queue_capacity: default_input_queue_capacity(),
            log_level: default_log_level(),
        }
    }
}

impl ServerConfig {
    /// Validate the configuration, returning every issue found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, server should not start) or
    /// "WARNING:" (advisory, server can start but the config is likely wrong).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.network.port == 0 {
            issues.push("ERROR: network.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.video.width == 0 || self.video.height == 0 {
            issues.push(format!(
                "ERROR: video resolution must be non-zero, got {}x{}.",
                self.video.width, self.video.height
            ));
        }
        if self.video.fps == 0 || self.video.fps > 120 {
            issues.push(format!("ERROR: video.fps must be between 1 and 120, got {}.", self.video.fps));
        }
        if self.video.bitrate_kbps == 0 {
            issues.push("ERROR: video.bitrate_kbps must be non-zero.".to_string());
        } else if self.video.bitrate_kbps > 100_000 {
            issues.push(format!(
                "WARNING: video.bitrate_kbps is {} — this is unusually high, typical values are 1000-20000.",
                self.video.bitrate_kbps
            ));
        }
        if self.network.max_connections == 0 {
            issues.push("WARNING: network.max_connections is 0, no client will ever be admitted.".to_string());
        }
        if self.session.input_queue_capacity == 0 {
            issues.push("ERROR: session.input_queue_capacity must be at least 1.".to_string());
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

/// Controller-side configuration (`mirrorctl`), covering per-connection
/// defaults; individual `DeviceSession`s may override timeouts per device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_discovery_liveness_timeout_secs")]
    pub discovery_liveness_timeout_secs: u64,
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            discovery_interval_secs: default_discovery_interval_secs(),
            discovery_liveness_timeout_secs: default_discovery_liveness_timeout_secs(),
            adb_path: default_adb_path(),
        }
    }
}

impl ControllerConfig {
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();
        if self.connect_timeout_ms == 0 {
            issues.push("ERROR: connect_timeout_ms must be non-zero.".to_string());
        }
        if self.max_reconnect_attempts == 0 {
            issues.push("WARNING: max_reconnect_attempts is 0, reconnect is effectively disabled.".to_string());
        }
        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_discovery_port() -> u16 {
    8081
}
fn default_max_connections() -> u32 {
    8
}
fn default_buffer_size() -> u32 {
    64 * 1024
}
fn default_socket_timeout_ms() -> u64 {
    5000
}
fn default_heartbeat_interval_ms() -> u64 {
    5000
}
fn default_discovery_interval_secs() -> u64 {
    5
}
fn default_discovery_liveness_timeout_secs() -> u64 {
    30
}
fn default_width() -> u32 {
    1280
}
fn default_height() -> u32 {
    720
}
fn default_bitrate_kbps() -> u32 {
    4000
}
fn default_fps() -> u32 {
    30
}
fn default_input_queue_capacity() -> u32 {
    10
}
fn default_log_level() -> String {
    "warn".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}
fn default_max_reconnect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    3000
}
fn default_adb_path() -> String {
    "adb".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.network.port, 8080);
        assert_eq!(cfg.network.discovery_port, 8081);
        assert_eq!(cfg.video.width, 1280);
        assert_eq!(cfg.video.height, 720);
        assert_eq!(cfg.video.bitrate_kbps, 4000);
        assert_eq!(cfg.video.fps, 30);
        assert_eq!(cfg.session.log_level, "warn");
    }

    #[test]
    fn defaults_validate_clean() {
        assert!(ServerConfig::default().validate().is_ok());
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = ServerConfig::default();
        cfg.network.port = 0;
        let issues = cfg.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("ERROR")));
    }

    #[test]
    fn fps_over_120_is_an_error() {
        let mut cfg = ServerConfig::default();
        cfg.video.fps = 121;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let cfg: ServerConfig = toml::from_str("[video]\nfps = 60\n").unwrap();
        assert_eq!(cfg.video.fps, 60);
        assert_eq!(cfg.video.width, 1280);
        assert_eq!(cfg.network.port, 8080);
    }
}
