// Client runtime for kestrel pub/sub: batched ordered publishing and leased-message dispatch.
//
// The publish path batches messages per ordering key, bounds outstanding work with a flow
// controller and retries batch RPCs. The subscribe path owns one or more streaming pulls, each
// feeding a dispatcher that delivers to user code, keeps leases alive and batches ack traffic.
// Wire transport is pluggable through the traits in `transport`.
#[macro_use]
mod macros;

pub mod clock;
pub mod config;
mod distribution;
pub mod error;
pub mod flow_control;
pub mod publisher;
pub mod sequential;
mod status;
pub mod subscriber;
pub mod tracer;
pub mod transport;
pub mod waiter;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    BatchingSettings, FlowControlSettings, LimitExceededBehavior, PublisherConfig, RetrySettings,
    ShutdownMode, SubscriberConfig, SubscriberShutdownSettings,
};
pub use error::{AckResponse, Cancelled, ConfigError, PublishError, SubscriberError};
pub use flow_control::{FlowControlError, FlowController};
pub use publisher::{PublishHandle, Publisher, PublisherBuilder};
pub use subscriber::{
    AckReplyConsumer, AckReplyConsumerWithResponse, MessageReceiver,
    MessageReceiverWithAckResponse, Receiver, Subscriber, SubscriberBuilder, SubscriberState,
};
pub use tracer::{LogTracer, NoopTracer, ProcessAction, PubsubTracer};
pub use transport::{PublisherTransport, PullStream, SubscriberTransport};
