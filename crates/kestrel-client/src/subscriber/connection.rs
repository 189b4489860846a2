// One streaming pull: stream ownership, reconnect with backoff, and ack RPC translation.
use async_trait::async_trait;
use futures::StreamExt;
use futures::future::join_all;
use kestrel_wire::{
    AckFailure, AcknowledgeRequest, Code, ModifyAckDeadlineRequest, Status, StreamingPullRequest,
    StreamingPullResponse,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::ack::{AckOperationsOutcome, AckOutcome, AckProcessor, ModackRequest};
use super::dispatcher::MessageDispatcher;
use crate::config::{SubscriberConfig, SubscriberShutdownSettings};
use crate::error::AckResponse;
use crate::status::{ack_response_for, is_stream_retryable};
use crate::transport::SubscriberTransport;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const MAX_PER_REQUEST_CHANGES: usize = 1000;

/// Sends ack operations as unary RPCs, chunked and issued concurrently.
pub(crate) struct StreamAckProcessor {
    transport: Arc<dyn SubscriberTransport>,
    subscription: String,
}

impl StreamAckProcessor {
    pub(crate) fn new(transport: Arc<dyn SubscriberTransport>, subscription: String) -> Self {
        Self {
            transport,
            subscription,
        }
    }
}

#[async_trait]
impl AckProcessor for StreamAckProcessor {
    async fn send_ack_operations(
        &self,
        acks: Vec<String>,
        modacks: Vec<ModackRequest>,
    ) -> AckOperationsOutcome {
        let ack_calls = acks.chunks(MAX_PER_REQUEST_CHANGES).map(|chunk| {
            let request = AcknowledgeRequest {
                subscription: self.subscription.clone(),
                ack_ids: chunk.to_vec(),
            };
            async move {
                let ack_ids = request.ack_ids.clone();
                (ack_ids, self.transport.acknowledge(request).await)
            }
        });
        let modack_calls = modacks.iter().flat_map(|modack| {
            modack
                .ack_ids
                .chunks(MAX_PER_REQUEST_CHANGES)
                .map(move |chunk| {
                    let request = ModifyAckDeadlineRequest {
                        subscription: self.subscription.clone(),
                        ack_ids: chunk.to_vec(),
                        ack_deadline_seconds: modack.deadline_seconds,
                    };
                    async move {
                        let ack_ids = request.ack_ids.clone();
                        (ack_ids, self.transport.modify_ack_deadline(request).await)
                    }
                })
        });
        let (ack_results, modack_results) =
            futures::join!(join_all(ack_calls), join_all(modack_calls));

        let mut outcome = AckOperationsOutcome::default();
        for (ack_ids, result) in ack_results {
            if let Err(status) = result {
                tracing::debug!(status = %status, count = ack_ids.len(), "acknowledge failed");
                for ack_id in ack_ids {
                    let classified = classify_ack_failure(&status, &ack_id);
                    outcome.acks.insert(ack_id, classified);
                }
            }
        }
        for (ack_ids, result) in modack_results {
            if let Err(status) = result {
                tracing::debug!(status = %status, count = ack_ids.len(), "modify ack deadline failed");
                for ack_id in ack_ids {
                    let classified = classify_ack_failure(&status, &ack_id);
                    outcome.modacks.insert(ack_id, classified);
                }
            }
        }
        outcome
    }
}

/// Classifies one ack id of a failed RPC, preferring the broker's per-id classification.
pub(crate) fn classify_ack_failure(status: &Status, ack_id: &str) -> AckOutcome {
    match status.ack_failure(ack_id) {
        Some(AckFailure::Transient) => AckOutcome::Transient,
        Some(AckFailure::Invalid) => AckOutcome::Failed(AckResponse::Invalid),
        Some(AckFailure::Permanent) => AckOutcome::Failed(ack_response_for(status.code)),
        None if status.code == Code::Ok => AckOutcome::Success,
        None if is_stream_retryable(status) => AckOutcome::Transient,
        None => AckOutcome::Failed(ack_response_for(status.code)),
    }
}

pub(crate) struct StreamingSubscriberConnection {
    config: SubscriberConfig,
    channel_affinity: usize,
    client_id: String,
    transport: Arc<dyn SubscriberTransport>,
    dispatcher: Arc<MessageDispatcher>,
    cancel: watch::Sender<bool>,
    failure: watch::Sender<Option<Status>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamingSubscriberConnection {
    pub(crate) fn new(
        config: SubscriberConfig,
        channel_affinity: usize,
        transport: Arc<dyn SubscriberTransport>,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Arc<Self> {
        let (cancel, _) = watch::channel(false);
        let (failure, _) = watch::channel(None);
        Arc::new(Self {
            config,
            channel_affinity,
            client_id: uuid::Uuid::new_v4().to_string(),
            transport,
            dispatcher,
            cancel,
            failure,
            task: Mutex::new(None),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        self.dispatcher.start();
        let connection = self.clone();
        *self.task.lock() = Some(tokio::spawn(async move { connection.run().await }));
    }

    /// Resolves to `Some(status)` once the connection fails fatally.
    pub(crate) fn failure(&self) -> watch::Receiver<Option<Status>> {
        self.failure.subscribe()
    }

    pub(crate) async fn stop(&self, settings: SubscriberShutdownSettings) {
        let _ = self.cancel.send(true);
        self.dispatcher.stop(settings).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        tracing::debug!(
            subscription = %self.config.subscription,
            channel = self.channel_affinity,
            "connection stopped"
        );
    }

    fn initial_request(&self) -> StreamingPullRequest {
        let flow = &self.config.flow_control;
        StreamingPullRequest {
            subscription: self.config.subscription.clone(),
            stream_ack_deadline_seconds: self.config.stream_ack_deadline().as_secs() as i32,
            client_id: self.client_id.clone(),
            max_outstanding_messages: flow.max_outstanding_element_count.unwrap_or(0) as i64,
            max_outstanding_bytes: flow.max_outstanding_request_bytes.unwrap_or(0) as i64,
        }
    }

    async fn run(self: Arc<Self>) {
        let mut cancel = self.cancel.subscribe();
        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *cancel.borrow() {
                return;
            }
            tracing::debug!(
                subscription = %self.config.subscription,
                channel = self.channel_affinity,
                client_id = %self.client_id,
                "opening streaming pull"
            );
            let opened = tokio::select! {
                _ = cancel.changed() => return,
                opened = self.transport.streaming_pull(self.initial_request()) => opened,
            };
            let error = match opened {
                Ok(mut stream) => loop {
                    let next = tokio::select! {
                        _ = cancel.changed() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(response)) => {
                            backoff = INITIAL_BACKOFF;
                            self.handle_response(response).await;
                        }
                        Some(Err(status)) => break Some(status),
                        None => break None,
                    }
                },
                Err(status) => Some(status),
            };

            match error {
                None => {
                    tracing::debug!(channel = self.channel_affinity, "stream closed; reopening");
                }
                Some(status) if is_stream_retryable(&status) => {
                    tracing::warn!(
                        channel = self.channel_affinity,
                        status = %status,
                        backoff = ?backoff,
                        "streaming pull failed; reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.changed() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Some(status) => {
                    tracing::error!(
                        subscription = %self.config.subscription,
                        channel = self.channel_affinity,
                        status = %status,
                        "streaming pull failed permanently"
                    );
                    self.dispatcher.stop(self.config.shutdown).await;
                    let _ = self.failure.send(Some(status));
                    return;
                }
            }
        }
    }

    async fn handle_response(&self, response: StreamingPullResponse) {
        if let Some(properties) = response.subscription_properties {
            self.dispatcher
                .set_exactly_once_delivery(properties.exactly_once_delivery_enabled);
            self.dispatcher
                .set_message_ordering(properties.message_ordering_enabled);
        }
        self.dispatcher
            .process_received_messages(response.received_messages)
            .await;
    }
}
