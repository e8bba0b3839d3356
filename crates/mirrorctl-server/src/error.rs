use thiserror::Error;

/// Error taxonomy for the streaming server, matching the kinds (not specific
/// identifiers) that propagate as terminal session events to the controller.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("operation requires the session to be initialized first")]
    NotInitialized,
    #[error("already running")]
    AlreadyRunning,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("network operation failed: {0}")]
    NetworkFailed(String),
    #[error("encoder failed: {0}")]
    EncoderFailed(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
    #[error("not running")]
    NotRunning,
}
