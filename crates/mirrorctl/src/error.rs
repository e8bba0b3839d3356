use thiserror::Error;

/// Error taxonomy for one device connection, matching the kinds spec'd for
/// the server side (`mirrorctl_server::error::ServerError`) that have a
/// client-side analogue, plus the controller's own deploy/port concerns.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("network operation failed: {0}")]
    NetworkFailed(String),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connected")]
    AlreadyConnected,
    #[error("a command is already outstanding on this connection")]
    CommandAlreadyOutstanding,
    #[error("command timed out waiting for a response")]
    CommandTimedOut,
    #[error("reconnect attempts exhausted")]
    ReconnectExhausted,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decoder backend failed: {0}")]
    BackendFailed(String),
    #[error("decoder exceeded its consecutive-error budget and is no longer usable")]
    Terminal,
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("device architecture query failed: {0}")]
    ArchitectureQueryFailed(String),
    #[error("push to device failed: {0}")]
    PushFailed(String),
    #[error("failed to mark remote binary executable: {0}")]
    ChmodFailed(String),
    #[error("failed to start remote server: {0}")]
    StartFailed(String),
    #[error("remote server did not become ready in time")]
    NotReady,
    #[error("failed to stop remote server: {0}")]
    StopFailed(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("port pool exhausted, no free port available")]
    PortPoolExhausted,
    #[error("no session for device {0}")]
    UnknownDevice(String),
    #[error("deploy failed: {0}")]
    Deploy(#[from] DeployError),
    #[error("client connection failed: {0}")]
    Client(#[from] ClientError),
}
