// In-memory broker implementing both transports, for demos and end-to-end tests.
use async_trait::async_trait;
use futures::StreamExt;
use kestrel_client::transport::{PublisherTransport, PullStream, SubscriberTransport};
use kestrel_wire::{
    AcknowledgeRequest, Code, ModifyAckDeadlineRequest, PublishRequest, PublishResponse,
    PubsubMessage, ReceivedMessage, Status, StreamingPullRequest, StreamingPullResponse,
    SubscriptionProperties,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;

const INVALID_ACK_ID_REASON: &str = "PERMANENT_FAILURE_INVALID_ACK_ID";
const MAX_MESSAGES_PER_RESPONSE: usize = 100;

/// A topic fan-out broker with lease tracking.
///
/// Every subscription attached to a topic receives each published message. Nacked messages
/// (modack to zero) are redelivered under a new ack id with the delivery attempt incremented.
///
/// ```
/// use kestrel_client::transport::PublisherTransport;
/// use kestrel_test_harness::InMemoryBroker;
/// use kestrel_wire::{PublishRequest, PubsubMessage};
///
/// let rt = tokio::runtime::Builder::new_current_thread().build().expect("runtime");
/// rt.block_on(async {
///     let broker = InMemoryBroker::new();
///     broker.create_subscription("orders", "orders-sub", false);
///     let response = broker
///         .publish(PublishRequest {
///             topic: "orders".into(),
///             messages: vec![PubsubMessage::new("hello")],
///             compress: false,
///         })
///         .await
///         .expect("publish");
///     assert_eq!(response.message_ids, vec!["1".to_string()]);
///     assert_eq!(broker.backlog("orders-sub"), 1);
/// });
/// ```
#[derive(Default)]
pub struct InMemoryBroker {
    // Topic name -> subscriptions attached to it.
    topics: Mutex<HashMap<String, Vec<Arc<SubscriptionQueue>>>>,
    // Subscription name -> queue.
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionQueue>>>,
    next_message_id: AtomicU64,
    next_ack_id: Arc<AtomicU64>,
}

struct SubscriptionQueue {
    name: String,
    exactly_once: bool,
    ready: Mutex<VecDeque<ReceivedMessage>>,
    // Ack id -> leased message.
    leased: Mutex<HashMap<String, ReceivedMessage>>,
    acked: Mutex<Vec<String>>,
    notify: Notify,
    next_ack_id: Arc<AtomicU64>,
}

impl SubscriptionQueue {
    fn enqueue(&self, message: PubsubMessage, delivery_attempt: i32) {
        let ack_id = format!(
            "{}-{}",
            self.name,
            self.next_ack_id.fetch_add(1, Ordering::Relaxed) + 1
        );
        self.ready.lock().push_back(ReceivedMessage {
            ack_id,
            message,
            delivery_attempt,
        });
        self.notify.notify_waiters();
    }

    fn lease_batch(&self) -> Vec<ReceivedMessage> {
        let mut ready = self.ready.lock();
        let count = ready.len().min(MAX_MESSAGES_PER_RESPONSE);
        let batch: Vec<ReceivedMessage> = ready.drain(..count).collect();
        drop(ready);
        let mut leased = self.leased.lock();
        for message in &batch {
            leased.insert(message.ack_id.clone(), message.clone());
        }
        batch
    }

    fn invalid_ids_status(&self, unknown: &[String]) -> Status {
        unknown.iter().fold(
            Status::new(Code::InvalidArgument, "unknown ack ids"),
            |status, ack_id| status.with_metadata(ack_id.clone(), INVALID_ACK_ID_REASON),
        )
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a subscription to `topic`, creating the topic if needed.
    pub fn create_subscription(&self, topic: &str, subscription: &str, exactly_once: bool) {
        let queue = Arc::new(SubscriptionQueue {
            name: subscription.to_string(),
            exactly_once,
            ready: Mutex::new(VecDeque::new()),
            leased: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            notify: Notify::new(),
            next_ack_id: self.next_ack_id.clone(),
        });
        self.topics
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push(queue.clone());
        self.subscriptions
            .lock()
            .insert(subscription.to_string(), queue);
    }

    /// Messages waiting to be leased.
    pub fn backlog(&self, subscription: &str) -> usize {
        self.queue(subscription)
            .map(|queue| queue.ready.lock().len())
            .unwrap_or(0)
    }

    /// Messages leased and not yet acked or nacked.
    pub fn leased(&self, subscription: &str) -> usize {
        self.queue(subscription)
            .map(|queue| queue.leased.lock().len())
            .unwrap_or(0)
    }

    /// Message ids acked so far, in ack order.
    pub fn acked_message_ids(&self, subscription: &str) -> Vec<String> {
        self.queue(subscription)
            .map(|queue| queue.acked.lock().clone())
            .unwrap_or_default()
    }

    fn queue(&self, subscription: &str) -> Option<Arc<SubscriptionQueue>> {
        self.subscriptions.lock().get(subscription).cloned()
    }

    fn require_queue(&self, subscription: &str) -> Result<Arc<SubscriptionQueue>, Status> {
        self.queue(subscription).ok_or_else(|| {
            Status::new(
                Code::NotFound,
                format!("subscription {subscription} not found"),
            )
        })
    }
}

#[async_trait]
impl PublisherTransport for InMemoryBroker {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, Status> {
        let queues = self
            .topics
            .lock()
            .get(&request.topic)
            .cloned()
            .ok_or_else(|| Status::new(Code::NotFound, format!("topic {} not found", request.topic)))?;
        let mut message_ids = Vec::with_capacity(request.messages.len());
        for mut message in request.messages {
            let id = (self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1).to_string();
            message.message_id = id.clone();
            for queue in &queues {
                queue.enqueue(message.clone(), 1);
            }
            message_ids.push(id);
        }
        tracing::trace!(topic = %request.topic, count = message_ids.len(), "broker accepted batch");
        Ok(PublishResponse { message_ids })
    }
}

#[async_trait]
impl SubscriberTransport for InMemoryBroker {
    async fn streaming_pull(&self, request: StreamingPullRequest) -> Result<PullStream, Status> {
        let queue = self.require_queue(&request.subscription)?;
        tracing::debug!(
            subscription = %request.subscription,
            client_id = %request.client_id,
            "broker stream opened"
        );
        let properties = SubscriptionProperties {
            exactly_once_delivery_enabled: queue.exactly_once,
            message_ordering_enabled: false,
        };
        let stream = futures::stream::unfold(queue, move |queue| async move {
            let batch = loop {
                let notified = queue.notify.notified();
                let batch = queue.lease_batch();
                if !batch.is_empty() {
                    break batch;
                }
                notified.await;
            };
            let response = StreamingPullResponse {
                received_messages: batch,
                subscription_properties: Some(properties),
            };
            Some((Ok(response), queue))
        });
        Ok(stream.boxed())
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status> {
        let queue = self.require_queue(&request.subscription)?;
        let mut unknown = Vec::new();
        {
            let mut leased = queue.leased.lock();
            let mut acked = queue.acked.lock();
            for ack_id in request.ack_ids {
                match leased.remove(&ack_id) {
                    Some(message) => acked.push(message.message.message_id),
                    None => unknown.push(ack_id),
                }
            }
        }
        if queue.exactly_once && !unknown.is_empty() {
            return Err(queue.invalid_ids_status(&unknown));
        }
        Ok(())
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status> {
        let queue = self.require_queue(&request.subscription)?;
        let mut unknown = Vec::new();
        let mut redeliver = Vec::new();
        {
            let mut leased = queue.leased.lock();
            for ack_id in request.ack_ids {
                if request.ack_deadline_seconds > 0 {
                    if !leased.contains_key(&ack_id) {
                        unknown.push(ack_id);
                    }
                    continue;
                }
                match leased.remove(&ack_id) {
                    Some(message) => redeliver.push(message),
                    None => unknown.push(ack_id),
                }
            }
        }
        for message in redeliver {
            queue.enqueue(message.message, message.delivery_attempt + 1);
        }
        if queue.exactly_once && !unknown.is_empty() {
            return Err(queue.invalid_ids_status(&unknown));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publish_request(topic: &str, payloads: &[&str]) -> PublishRequest {
        PublishRequest {
            topic: topic.to_string(),
            messages: payloads.iter().map(|p| PubsubMessage::new(p.to_string())).collect(),
            compress: false,
        }
    }

    #[tokio::test]
    async fn unknown_topic_is_not_found() {
        let broker = InMemoryBroker::new();
        let err = broker
            .publish(publish_request("missing", &["a"]))
            .await
            .expect_err("no topic");
        assert_eq!(err.code, Code::NotFound);
    }

    #[tokio::test]
    async fn nack_redelivers_with_next_attempt() {
        let broker = InMemoryBroker::new();
        broker.create_subscription("t", "s", false);
        broker.publish(publish_request("t", &["a"])).await.expect("publish");

        let mut stream = broker
            .streaming_pull(StreamingPullRequest {
                subscription: "s".into(),
                stream_ack_deadline_seconds: 60,
                client_id: "c".into(),
                max_outstanding_messages: 0,
                max_outstanding_bytes: 0,
            })
            .await
            .expect("open");
        let first = stream.next().await.expect("item").expect("ok");
        let leased = first.received_messages[0].clone();
        assert_eq!(leased.delivery_attempt, 1);

        broker
            .modify_ack_deadline(ModifyAckDeadlineRequest {
                subscription: "s".into(),
                ack_ids: vec![leased.ack_id.clone()],
                ack_deadline_seconds: 0,
            })
            .await
            .expect("nack");
        let second = stream.next().await.expect("item").expect("ok");
        let redelivered = &second.received_messages[0];
        assert_eq!(redelivered.delivery_attempt, 2);
        assert_ne!(redelivered.ack_id, leased.ack_id);
        assert_eq!(redelivered.message.message_id, leased.message.message_id);
    }

    #[tokio::test]
    async fn exactly_once_rejects_unknown_ack_ids() {
        let broker = InMemoryBroker::new();
        broker.create_subscription("t", "s", true);
        let err = broker
            .acknowledge(AcknowledgeRequest {
                subscription: "s".into(),
                ack_ids: vec!["nope".into()],
            })
            .await
            .expect_err("invalid");
        assert_eq!(
            err.ack_failure("nope"),
            Some(kestrel_wire::AckFailure::Invalid)
        );
    }
}
