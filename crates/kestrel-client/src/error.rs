// Error types surfaced by the publisher and subscriber.
use kestrel_wire::Status;

use crate::flow_control::FlowControlError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid config: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Marker for work cancelled because an earlier task on the same key failed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("cancelled after an earlier failure on the same key")]
pub struct Cancelled;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("publisher is shut down")]
    Shutdown,
    #[error("invalid publish request: {0}")]
    Config(String),
    #[error(transparent)]
    FlowControl(#[from] FlowControlError),
    /// An earlier batch for the same ordering key failed; call `resume_publish` to clear it.
    #[error("publish cancelled: ordering key is paused after an earlier failure")]
    Cancelled,
    #[error("publish rpc failed: {0}")]
    Rpc(Status),
    #[error("publish response carried {actual} message ids for {expected} messages")]
    ResponseMismatch { expected: usize, actual: usize },
}

impl From<Cancelled> for PublishError {
    fn from(_: Cancelled) -> Self {
        PublishError::Cancelled
    }
}

impl From<ConfigError> for PublishError {
    fn from(err: ConfigError) -> Self {
        PublishError::Config(err.0)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriberError {
    #[error("subscriber already started")]
    AlreadyStarted,
    #[error("subscriber is not running")]
    NotRunning,
    #[error("invalid subscriber config: {0}")]
    Config(String),
    #[error("streaming pull failed: {0}")]
    Stream(Status),
}

impl From<ConfigError> for SubscriberError {
    fn from(err: ConfigError) -> Self {
        SubscriberError::Config(err.0)
    }
}

/// Terminal outcome of an ack or nack under exactly-once delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckResponse {
    Successful,
    /// The ack id is unknown or already settled.
    Invalid,
    PermissionDenied,
    FailedPrecondition,
    Other,
}
