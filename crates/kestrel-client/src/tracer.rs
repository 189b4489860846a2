// Telemetry hooks bracketing the publish and subscribe paths. Hooks observe only.
use kestrel_wire::Status;

use crate::flow_control::FlowControlError;

/// What a subscriber did with a leased message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAction {
    Ack,
    Nack,
}

impl ProcessAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessAction::Ack => "ack",
            ProcessAction::Nack => "nack",
        }
    }
}

#[allow(unused_variables)]
pub trait PubsubTracer: Send + Sync + 'static {
    fn publish_create_start(&self, topic: &str, ordering_key: &str, size: usize) {}
    fn publish_create_end(&self, topic: &str, ordering_key: &str) {}
    fn flow_control_start(&self, size: usize) {}
    fn flow_control_end(&self, size: usize) {}
    fn flow_control_error(&self, error: &FlowControlError) {}
    fn batching_start(&self, ordering_key: &str) {}
    fn batching_end(&self, ordering_key: &str, batch_size: usize) {}
    fn publish_rpc_start(&self, topic: &str, batch_size: usize) {}
    fn publish_rpc_end(&self, topic: &str, batch_size: usize, error: Option<&Status>) {}
    fn subscribe_receive(&self, subscription: &str, ack_id: &str, delivery_attempt: i32) {}
    fn subscribe_admitted(&self, subscription: &str, ack_id: &str) {}
    fn subscribe_process_end(&self, subscription: &str, ack_id: &str, action: ProcessAction) {}
    fn subscribe_expired(&self, subscription: &str, ack_id: &str) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl PubsubTracer for NoopTracer {}

/// Emits every hook as a `tracing` event at debug level (trace for per-message subscribe hooks).
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

impl PubsubTracer for LogTracer {
    fn publish_create_start(&self, topic: &str, ordering_key: &str, size: usize) {
        tracing::debug!(topic, ordering_key, size, "publish create start");
    }

    fn publish_create_end(&self, topic: &str, ordering_key: &str) {
        tracing::debug!(topic, ordering_key, "publish create end");
    }

    fn flow_control_start(&self, size: usize) {
        tracing::debug!(size, "publish flow control start");
    }

    fn flow_control_end(&self, size: usize) {
        tracing::debug!(size, "publish flow control end");
    }

    fn flow_control_error(&self, error: &FlowControlError) {
        tracing::debug!(error = %error, "publish flow control rejected");
    }

    fn batching_start(&self, ordering_key: &str) {
        tracing::debug!(ordering_key, "publish batching start");
    }

    fn batching_end(&self, ordering_key: &str, batch_size: usize) {
        tracing::debug!(ordering_key, batch_size, "publish batching end");
    }

    fn publish_rpc_start(&self, topic: &str, batch_size: usize) {
        tracing::debug!(topic, batch_size, "publish rpc start");
    }

    fn publish_rpc_end(&self, topic: &str, batch_size: usize, error: Option<&Status>) {
        match error {
            Some(status) => tracing::debug!(topic, batch_size, status = %status, "publish rpc failed"),
            None => tracing::debug!(topic, batch_size, "publish rpc end"),
        }
    }

    fn subscribe_receive(&self, subscription: &str, ack_id: &str, delivery_attempt: i32) {
        tracing::trace!(subscription, ack_id, delivery_attempt, "message received");
    }

    fn subscribe_admitted(&self, subscription: &str, ack_id: &str) {
        tracing::trace!(subscription, ack_id, "message admitted by flow control");
    }

    fn subscribe_process_end(&self, subscription: &str, ack_id: &str, action: ProcessAction) {
        tracing::trace!(subscription, ack_id, action = action.as_str(), "message processed");
    }

    fn subscribe_expired(&self, subscription: &str, ack_id: &str) {
        tracing::trace!(subscription, ack_id, "message lease expired");
    }
}
