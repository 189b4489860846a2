// Transport-neutral messages and request shapes shared by the client runtime and transports.
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Attribute added to delivered messages when the broker reports a delivery attempt count.
pub const DELIVERY_ATTEMPT_ATTRIBUTE: &str = "kestrel_delivery_attempt";

// Per-ack-id failure metadata prefixes reported by the broker on a failed ack/modack RPC.
const TRANSIENT_FAILURE_PREFIX: &str = "TRANSIENT_";
const INVALID_ACK_ID_REASON: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";

/// An application message.
///
/// ```
/// use kestrel_wire::PubsubMessage;
///
/// let message = PubsubMessage::new("hello")
///     .with_ordering_key("user-42")
///     .with_attribute("kind", "greeting");
/// assert_eq!(message.ordering_key, "user-42");
/// assert_eq!(message.serialized_size(), 5 + 7 + 4 + 8);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubMessage {
    pub data: Bytes,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    #[serde(default)]
    pub ordering_key: String,
    #[serde(default)]
    pub message_id: String,
}

impl PubsubMessage {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = key.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Bytes this message counts against batching and flow-control budgets.
    pub fn serialized_size(&self) -> usize {
        let attributes: usize = self
            .attributes
            .iter()
            .map(|(key, value)| key.len() + value.len())
            .sum();
        self.data.len() + self.ordering_key.len() + attributes
    }

    /// Delivery attempt recorded on a delivered message, if the broker reported one.
    pub fn delivery_attempt(&self) -> Option<i32> {
        self.attributes
            .get(DELIVERY_ATTEMPT_ATTRIBUTE)
            .and_then(|value| value.parse().ok())
    }
}

/// A message leased to this client by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message: PubsubMessage,
    /// Zero when the subscription has no dead-letter policy.
    #[serde(default)]
    pub delivery_attempt: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRequest {
    pub topic: String,
    pub messages: Vec<PubsubMessage>,
    /// Ask the transport to compress the encoded request.
    #[serde(default)]
    pub compress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub message_ids: Vec<String>,
}

/// First request on a streaming pull; later traffic on the stream is server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullRequest {
    pub subscription: String,
    pub stream_ack_deadline_seconds: i32,
    pub client_id: String,
    pub max_outstanding_messages: i64,
    pub max_outstanding_bytes: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionProperties {
    pub exactly_once_delivery_enabled: bool,
    pub message_ordering_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingPullResponse {
    pub received_messages: Vec<ReceivedMessage>,
    #[serde(default)]
    pub subscription_properties: Option<SubscriptionProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyAckDeadlineRequest {
    pub subscription: String,
    pub ack_ids: Vec<String>,
    pub ack_deadline_seconds: i32,
}

/// RPC status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Code {
    Ok,
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Code::Ok => "OK",
            Code::Cancelled => "CANCELLED",
            Code::Unknown => "UNKNOWN",
            Code::InvalidArgument => "INVALID_ARGUMENT",
            Code::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Code::NotFound => "NOT_FOUND",
            Code::AlreadyExists => "ALREADY_EXISTS",
            Code::PermissionDenied => "PERMISSION_DENIED",
            Code::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Code::FailedPrecondition => "FAILED_PRECONDITION",
            Code::Aborted => "ABORTED",
            Code::OutOfRange => "OUT_OF_RANGE",
            Code::Unimplemented => "UNIMPLEMENTED",
            Code::Internal => "INTERNAL",
            Code::Unavailable => "UNAVAILABLE",
            Code::DataLoss => "DATA_LOSS",
            Code::Unauthenticated => "UNAUTHENTICATED",
        };
        f.write_str(name)
    }
}

/// How the broker classified the failure of one ack id inside a failed ack/modack RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckFailure {
    /// Retrying the same ack id may succeed.
    Transient,
    /// The ack id is unknown or already settled.
    Invalid,
    /// Any other failure that will not go away on retry.
    Permanent,
}

impl AckFailure {
    /// Classify one broker metadata value.
    ///
    /// ```
    /// use kestrel_wire::AckFailure;
    ///
    /// assert_eq!(AckFailure::classify("TRANSIENT_FAILURE_UNORDERED_ACK_ID"), AckFailure::Transient);
    /// assert_eq!(AckFailure::classify("PERMANENT_FAILURE_INVALID_ACK_ID"), AckFailure::Invalid);
    /// assert_eq!(AckFailure::classify("something else"), AckFailure::Permanent);
    /// ```
    pub fn classify(reason: &str) -> Self {
        if reason.starts_with(TRANSIENT_FAILURE_PREFIX) {
            AckFailure::Transient
        } else if reason.starts_with(INVALID_ACK_ID_REASON) {
            AckFailure::Invalid
        } else {
            // PERMANENT_ prefixed and unrecognized reasons are both final.
            AckFailure::Permanent
        }
    }
}

/// Status returned by a failed RPC or stream.
///
/// `metadata` maps ack ids to broker failure reasons for ack/modack RPCs. The broker may attach it
/// even to a status whose code is [`Code::Ok`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Status {
    pub code: Code,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Per-ack-id classification carried by this status, if the broker reported one.
    pub fn ack_failure(&self, ack_id: &str) -> Option<AckFailure> {
        self.metadata
            .get(ack_id)
            .map(|reason| AckFailure::classify(reason))
    }
}
