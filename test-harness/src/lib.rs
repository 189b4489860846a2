// Test support for kestrel: scripted transports and an in-memory broker.
pub mod broker;
pub mod scripted;

pub use broker::InMemoryBroker;
pub use scripted::{PublishReply, ScriptedPublisher, ScriptedSubscriber, StreamScript};

use kestrel_wire::{PubsubMessage, ReceivedMessage, StreamingPullResponse};

/// A leased message with the given ack id and UTF-8 payload.
pub fn received(ack_id: &str, payload: &str) -> ReceivedMessage {
    ReceivedMessage {
        ack_id: ack_id.to_string(),
        message: PubsubMessage::new(payload.to_string()),
        delivery_attempt: 0,
    }
}

/// A stream response carrying `messages` and no subscription properties.
pub fn pull_response(messages: Vec<ReceivedMessage>) -> StreamingPullResponse {
    StreamingPullResponse {
        received_messages: messages,
        subscription_properties: None,
    }
}
