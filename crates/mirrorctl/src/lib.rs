pub mod cli;
pub mod connection;
pub mod controller;
pub mod decoder;
pub mod deploy;
pub mod discovery;
pub mod error;
pub mod input_event;
pub mod port_pool;
pub mod settings;
pub mod socket;
pub mod stats;

pub use connection::{ChannelSink, ClientConnection, ConnectionConfig, ConnectionEvent, ConnectionSink, ConnectionState, NullSink};
pub use controller::{DeviceSession, DeviceSessionState, MultiSessionController};
pub use decoder::{DecodedImage, DecoderHarness, DecoderStatsSnapshot, H264Decoder, OutputPixelFormat, TargetGeometry};
pub use deploy::{AdbDeployer, DeviceDeployer};
pub use discovery::{DiscoveredPeer, DiscoveryClient};
pub use error::{ClientError, ControllerError, DecodeError, DeployError};
pub use port_pool::PortPool;
pub use settings::{ControllerSettings, DeviceRegistry, DeviceRegistryEntry, RegisteredDeviceStatus};
