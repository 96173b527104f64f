use crate::types::InstanceKey;

/// Rejections surfaced to callers of the control surface.
///
/// These are request-level errors: none of them indicate that the service
/// itself is unhealthy.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("instance {0} is already running")]
    AlreadyRunning(InstanceKey),

    #[error("instance {0} is not running")]
    NotRunning(InstanceKey),

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn instance thread: {0}")]
    Spawn(#[from] std::io::Error),
}
