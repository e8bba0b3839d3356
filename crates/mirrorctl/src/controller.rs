//! Multi-session controller (spec.md §4.8): owns one [`ClientConnection`]
//! per device plus the [`PortPool`] and [`DeviceDeployer`] needed to bring a
//! remote server up before connecting to it, and aggregates per-device
//! stats into fleet-wide numbers.
//!
//! Grounded in the teacher's `server::session` registry shape (a
//! `Mutex<HashMap<id, Entry>>` guarding session lifecycle) generalized from
//! "one entry per connected peer" to "one entry per managed device".

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::connection::{ChannelSink, ClientConnection, ConnectionConfig, ConnectionEvent, ConnectionSink};
use crate::decoder::{DecoderHarness, H264Decoder, TargetGeometry};
use crate::deploy::{self, DeviceDeployer};
use crate::error::ControllerError;
use crate::port_pool::PortPool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSessionState {
    Idle,
    Deploying,
    Launching,
    Connecting,
    Streaming,
    Error,
}

pub struct DeviceSession {
    pub device_id: String,
    pub address: IpAddr,
    pub port: u16,
    pub state: Mutex<DeviceSessionState>,
    pub connection: Arc<ClientConnection>,
}

/// Constructs the decoder used for a freshly started session. Grounded in
/// `decoder.rs`'s feature-gated backend selection; the concrete decoder
/// implementation is supplied by the caller so this module stays agnostic
/// to which codec backend is linked in.
pub type DecoderFactory = dyn Fn() -> Box<dyn H264Decoder> + Send + Sync;

pub struct MultiSessionController {
    ports: PortPool,
    deployer: Arc<dyn DeviceDeployer>,
    artifact_dir: PathBuf,
    decoder_factory: Arc<DecoderFactory>,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
    sink: Arc<dyn ConnectionSink>,
}

impl MultiSessionController {
    pub fn new(
        deployer: Arc<dyn DeviceDeployer>,
        artifact_dir: PathBuf,
        decoder_factory: Arc<DecoderFactory>,
        sink: Arc<dyn ConnectionSink>,
    ) -> Self {
        Self {
            ports: PortPool::new(),
            deployer,
            artifact_dir,
            decoder_factory,
            sessions: Mutex::new(HashMap::new()),
            sink,
        }
    }

    /// Deploys the remote server (if not already deployed), allocates a
    /// port, and starts the client connection for `device_id`. Returns the
    /// existing session unchanged if one is already active.
    pub fn start_streaming(&self, device_id: &str, address: IpAddr, port_hint: Option<u16>) -> Result<Arc<DeviceSession>, ControllerError> {
        if let Some(existing) = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(device_id) {
            return Ok(existing.clone());
        }

        let port = match port_hint {
            Some(p) => p,
            None => {
                let allocated = self.ports.allocate(device_id);
                if allocated == crate::port_pool::NO_PORT {
                    return Err(ControllerError::PortPoolExhausted);
                }
                allocated
            }
        };

        deploy::deploy_and_start(self.deployer.as_ref(), device_id, &self.artifact_dir, port)?;

        let decoder = DecoderHarness::new((self.decoder_factory)(), TargetGeometry::default(), false);
        let socket_addr = SocketAddr::new(address, port);
        let device_sink: Arc<dyn ConnectionSink> = Arc::new(ForwardingSink { device_id: device_id.to_string(), inner: self.sink.clone() });
        let connection = ClientConnection::new(device_id.to_string(), socket_addr, ConnectionConfig::default(), decoder, device_sink);
        connection.start();

        let session = Arc::new(DeviceSession {
            device_id: device_id.to_string(),
            address,
            port,
            state: Mutex::new(DeviceSessionState::Connecting),
            connection,
        });
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).insert(device_id.to_string(), session.clone());
        Ok(session)
    }

    /// Disconnects the client and stops the remote server for `device_id`.
    /// Returns `false` if no session existed for this device, matching the
    /// idempotence law already established on `ClientConnection::disconnect`.
    pub fn stop_streaming(&self, device_id: &str) -> bool {
        let session = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).remove(device_id);
        let Some(session) = session else {
            return false;
        };
        session.connection.disconnect();
        let _ = deploy::stop(self.deployer.as_ref(), device_id);
        self.ports.release(device_id);
        true
    }

    pub fn stop_all(&self) {
        let device_ids: Vec<String> = self.sessions.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect();
        for device_id in device_ids {
            self.stop_streaming(&device_id);
        }
    }

    pub fn session(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).get(device_id).cloned()
    }

    pub fn device_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).keys().cloned().collect()
    }

    pub fn total_frame_count(&self) -> u64 {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.connection.stats.snapshot().frame_count)
            .sum()
    }

    pub fn total_error_count(&self) -> u64 {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|s| s.connection.stats.snapshot().error_count)
            .sum()
    }

    pub fn all_device_fps(&self) -> HashMap<String, f64> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, s)| (id.clone(), s.connection.stats.snapshot().current_fps))
            .collect()
    }

    /// Mean FPS across active sessions, or `0.0` when none are active.
    pub fn average_fps(&self) -> f64 {
        let fps = self.all_device_fps();
        if fps.is_empty() {
            return 0.0;
        }
        fps.values().sum::<f64>() / fps.len() as f64
    }
}

/// Tags every event from one device's connection with its id before handing
/// it to the controller-wide sink, so a single channel can multiplex all
/// sessions without each `ClientConnection` needing to know about the
/// others.
struct ForwardingSink {
    device_id: String,
    inner: Arc<dyn ConnectionSink>,
}

impl ConnectionSink for ForwardingSink {
    fn on_event(&self, _device_id: &str, event: ConnectionEvent) {
        self.inner.on_event(&self.device_id, event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::SyntheticDecoder;
    use std::path::Path;
    use std::sync::mpsc::channel;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeDeployer {
        started: StdMutex<Vec<String>>,
        stopped: StdMutex<Vec<String>>,
    }

    impl DeviceDeployer for FakeDeployer {
        fn architecture(&self, _device_id: &str) -> Result<String, crate::error::DeployError> {
            Ok("arm64-v8a".to_string())
        }
        fn push(&self, _device_id: &str, _local_path: &Path, _remote_path: &str) -> Result<(), crate::error::DeployError> {
            Ok(())
        }
        fn chmod_executable(&self, _device_id: &str, _remote_path: &str) -> Result<(), crate::error::DeployError> {
            Ok(())
        }
        fn start_detached(&self, device_id: &str, _remote_path: &str, _args: &[String], _log_path: &str) -> Result<(), crate::error::DeployError> {
            self.started.lock().unwrap().push(device_id.to_string());
            Ok(())
        }
        fn is_running(&self, _device_id: &str, _process_name: &str) -> Result<bool, crate::error::DeployError> {
            Ok(true)
        }
        fn tail_log(&self, _device_id: &str, _log_path: &str, _lines: usize) -> Result<String, crate::error::DeployError> {
            Ok(String::new())
        }
        fn kill_by_name(&self, device_id: &str, _process_name: &str) -> Result<(), crate::error::DeployError> {
            self.stopped.lock().unwrap().push(device_id.to_string());
            Ok(())
        }
    }

    fn controller() -> MultiSessionController {
        let (tx, _rx) = channel();
        MultiSessionController::new(
            Arc::new(FakeDeployer::default()),
            PathBuf::from("/artifacts"),
            Arc::new(|| Box::new(SyntheticDecoder::new(16, 16)) as Box<dyn H264Decoder>),
            Arc::new(ChannelSink(tx)),
        )
    }

    #[test]
    fn start_streaming_allocates_a_port_and_registers_a_session() {
        let controller = controller();
        let session = controller.start_streaming("dev1", "127.0.0.1".parse().unwrap(), None).unwrap();
        assert_eq!(session.port, crate::port_pool::PORT_RANGE_START);
        assert_eq!(controller.device_ids(), vec!["dev1".to_string()]);
        controller.stop_streaming("dev1");
    }

    #[test]
    fn start_streaming_twice_for_the_same_device_is_idempotent() {
        let controller = controller();
        let first = controller.start_streaming("dev1", "127.0.0.1".parse().unwrap(), None).unwrap();
        let second = controller.start_streaming("dev1", "127.0.0.1".parse().unwrap(), None).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        controller.stop_streaming("dev1");
    }

    #[test]
    fn stop_streaming_unknown_device_returns_false() {
        let controller = controller();
        assert!(!controller.stop_streaming("never-started"));
    }

    #[test]
    fn average_fps_is_zero_with_no_sessions() {
        let controller = controller();
        assert_eq!(controller.average_fps(), 0.0);
    }

    #[test]
    fn stop_all_releases_every_port() {
        let controller = controller();
        controller.start_streaming("dev1", "127.0.0.1".parse().unwrap(), None).unwrap();
        controller.start_streaming("dev2", "127.0.0.1".parse().unwrap(), None).unwrap();
        controller.stop_all();
        assert!(controller.device_ids().is_empty());
        assert_eq!(
            controller.ports.free_count(),
            (crate::port_pool::PORT_RANGE_END - crate::port_pool::PORT_RANGE_START + 1) as usize
        );
    }
}
