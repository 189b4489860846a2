// Publisher: batching, per-key ordering, retries and shutdown.
mod batch;

use kestrel_wire::{Code, PublishRequest, PubsubMessage, Status};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{LimitExceededBehavior, PublisherConfig};
use crate::error::PublishError;
use crate::flow_control::{FlowControlError, FlowControlLease, FlowController};
use crate::sequential::CallbackExecutor;
use crate::status::is_publish_retryable;
use crate::tracer::{NoopTracer, PubsubTracer};
use crate::transport::PublisherTransport;
use crate::waiter::Waiter;

use batch::{MessagesBatch, OutstandingBatch, OutstandingPublish, PublishResult};

/// Resolves to the server-assigned message id once the message's batch settles.
#[must_use = "a publish handle does nothing unless awaited"]
pub struct PublishHandle {
    rx: oneshot::Receiver<PublishResult>,
}

impl PublishHandle {
    fn settled(result: PublishResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for PublishHandle {
    type Output = PublishResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(PublishError::Cancelled)))
    }
}

/// Retry budget after ordering adjustments.
#[derive(Debug, Clone)]
struct RetryPolicy {
    total_timeout: Option<Duration>,
    initial_retry_delay: Duration,
    retry_delay_multiplier: f64,
    max_retry_delay: Duration,
    initial_rpc_timeout: Duration,
    rpc_timeout_multiplier: f64,
    max_rpc_timeout: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    fn from_config(config: &PublisherConfig) -> Self {
        let retry = &config.retry;
        // Ordered batches may not be dropped mid-sequence, so ordering retries until success or a
        // non-retryable code.
        let (total_timeout, max_attempts) = if config.enable_message_ordering {
            (None, 0)
        } else {
            (Some(retry.total_timeout), retry.max_attempts)
        };
        Self {
            total_timeout,
            initial_retry_delay: retry.initial_retry_delay,
            retry_delay_multiplier: retry.retry_delay_multiplier,
            max_retry_delay: retry.max_retry_delay,
            initial_rpc_timeout: retry.initial_rpc_timeout,
            rpc_timeout_multiplier: retry.rpc_timeout_multiplier,
            max_rpc_timeout: retry.max_rpc_timeout,
            max_attempts,
        }
    }
}

#[derive(Default)]
struct BatchState {
    batches: HashMap<String, MessagesBatch>,
    alarm: Option<JoinHandle<()>>,
    shutdown: bool,
}

#[derive(Clone)]
pub struct Publisher {
    pub(crate) inner: Arc<PublisherInner>,
}

pub(crate) struct PublisherInner {
    config: PublisherConfig,
    retry: RetryPolicy,
    transport: Arc<dyn PublisherTransport>,
    tracer: Arc<dyn PubsubTracer>,
    clock: Arc<dyn Clock>,
    flow_controller: FlowController,
    sequential: CallbackExecutor,
    state: Mutex<BatchState>,
    messages_waiter: Waiter,
    shutdown: AtomicBool,
}

pub struct PublisherBuilder {
    config: PublisherConfig,
    transport: Arc<dyn PublisherTransport>,
    tracer: Arc<dyn PubsubTracer>,
    clock: Arc<dyn Clock>,
}

impl PublisherBuilder {
    pub fn tracer(mut self, tracer: Arc<dyn PubsubTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Publisher, PublishError> {
        self.config.validate()?;
        tracing::debug!(
            topic = %self.config.topic,
            ordering = self.config.enable_message_ordering,
            "publisher created"
        );
        Ok(Publisher {
            inner: Arc::new(PublisherInner {
                retry: RetryPolicy::from_config(&self.config),
                flow_controller: FlowController::new(&self.config.flow_control),
                config: self.config,
                transport: self.transport,
                tracer: self.tracer,
                clock: self.clock,
                sequential: CallbackExecutor::new(),
                state: Mutex::new(BatchState::default()),
                messages_waiter: Waiter::new(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }
}

impl Publisher {
    pub fn builder(
        config: PublisherConfig,
        transport: Arc<dyn PublisherTransport>,
    ) -> PublisherBuilder {
        PublisherBuilder {
            config,
            transport,
            tracer: Arc::new(NoopTracer),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(
        config: PublisherConfig,
        transport: Arc<dyn PublisherTransport>,
    ) -> Result<Self, PublishError> {
        Self::builder(config, transport).build()
    }

    pub fn topic(&self) -> &str {
        &self.inner.config.topic
    }

    /// Schedules `message` for publishing.
    ///
    /// Returns `Err` for a shut-down publisher or an ordering key used without ordering enabled.
    /// Every other failure, including flow-control rejection, settles the returned handle. Under
    /// `Block` flow control this waits for capacity before the message is batched.
    pub async fn publish(&self, message: PubsubMessage) -> Result<PublishHandle, PublishError> {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::Acquire) {
            return Err(PublishError::Shutdown);
        }
        let ordering_key = message.ordering_key.clone();
        if !ordering_key.is_empty() && !inner.config.enable_message_ordering {
            return Err(PublishError::Config(
                "an ordering key requires message ordering to be enabled".to_string(),
            ));
        }

        let size = message.serialized_size();
        let topic = inner.config.topic.as_str();
        inner.tracer.publish_create_start(topic, &ordering_key, size);
        let handle = match inner.reserve(size).await {
            Ok(lease) => inner.enqueue(message, ordering_key.clone(), size, lease),
            Err(err) => {
                inner.tracer.flow_control_error(&err);
                if !ordering_key.is_empty() {
                    inner.sequential.stop_publish(&ordering_key);
                }
                PublishHandle::settled(Err(err.into()))
            }
        };
        inner.tracer.publish_create_end(topic, &ordering_key);
        Ok(handle)
    }

    /// Clears the paused state of `key` after a failed ordered publish.
    pub fn resume_publish(&self, key: &str) {
        if self.inner.config.enable_message_ordering {
            self.inner.sequential.resume_publish(key);
        }
    }

    /// Sends every open batch now without waiting for results.
    pub fn publish_all_outstanding(&self) {
        self.inner.publish_all_outstanding();
    }

    /// Flushes open batches, stops accepting messages and waits for every message to settle.
    pub async fn shutdown(&self) -> Result<(), PublishError> {
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                return Err(PublishError::Shutdown);
            }
            state.shutdown = true;
            self.inner.shutdown.store(true, Ordering::Release);
            if let Some(alarm) = state.alarm.take() {
                alarm.abort();
            }
        }
        tracing::debug!(topic = %self.inner.config.topic, "publisher shutting down");
        self.inner.publish_all_outstanding();
        self.inner.messages_waiter.wait_complete().await;
        tracing::debug!(topic = %self.inner.config.topic, "publisher shut down");
        Ok(())
    }
}

impl PublisherInner {
    async fn reserve(
        &self,
        size: usize,
    ) -> Result<FlowControlLease, FlowControlError> {
        let controller = &self.flow_controller;
        if controller.behavior() != LimitExceededBehavior::Ignore
            && let Some(limit) = controller.byte_limit()
            && size as u64 > limit
        {
            return Err(FlowControlError::MessageTooLarge {
                size: size as u64,
                limit,
            });
        }
        self.tracer.flow_control_start(size);
        let lease = controller.reserve(1, size as u64).await?;
        self.tracer.flow_control_end(size);
        Ok(lease)
    }

    fn enqueue(
        self: &Arc<Self>,
        message: PubsubMessage,
        ordering_key: String,
        size: usize,
        lease: FlowControlLease,
    ) -> PublishHandle {
        let (result_tx, rx) = oneshot::channel();
        let publish = OutstandingPublish {
            message,
            size,
            result_tx,
            lease,
        };

        let mut state = self.state.lock();
        if state.shutdown {
            drop(state);
            let _ = publish.result_tx.send(Err(PublishError::Shutdown));
            return PublishHandle { rx };
        }
        if !ordering_key.is_empty() && self.sequential.key_has_error(&ordering_key) {
            drop(state);
            let _ = publish.result_tx.send(Err(PublishError::Cancelled));
            return PublishHandle { rx };
        }

        self.tracer.batching_start(&ordering_key);
        self.messages_waiter.increment_pending_count(1);
        let topic = self.config.topic.as_str();
        let batching = &self.config.batching;
        let batch = state
            .batches
            .entry(ordering_key.clone())
            .or_insert_with(|| MessagesBatch::new(ordering_key.clone(), topic, batching));
        let ready = batch.add(publish);
        if batch.is_empty() {
            state.batches.remove(&ordering_key);
        }
        self.setup_alarm(&mut state);

        if ordering_key.is_empty() {
            drop(state);
            for batch in ready {
                self.spawn_unordered(batch);
            }
        } else {
            // Submitted under the lock so batches for one key reach the queue in order.
            for batch in ready {
                self.submit_ordered(batch);
            }
        }
        PublishHandle { rx }
    }

    fn setup_alarm(self: &Arc<Self>, state: &mut BatchState) {
        if state.batches.is_empty() || state.alarm.is_some() {
            return;
        }
        let inner = self.clone();
        let delay = self.config.batching.delay_threshold;
        state.alarm = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.publish_all_without_inflight();
        }));
    }

    /// Alarm flush: ordered keys with a batch in flight keep their open batch until it settles.
    fn publish_all_without_inflight(self: &Arc<Self>) {
        let mut unordered = Vec::new();
        {
            let mut state = self.state.lock();
            state.alarm = None;
            let keys: Vec<String> = state.batches.keys().cloned().collect();
            for key in keys {
                if !key.is_empty() && self.sequential.has_tasks_inflight(&key) {
                    continue;
                }
                let Some(mut batch) = state.batches.remove(&key) else {
                    continue;
                };
                let outstanding = batch.pop_outstanding_batch();
                if key.is_empty() {
                    unordered.push(outstanding);
                } else {
                    self.submit_ordered(outstanding);
                }
            }
        }
        for batch in unordered {
            self.spawn_unordered(batch);
        }
    }

    fn publish_all_outstanding(self: &Arc<Self>) {
        let mut unordered = Vec::new();
        {
            let mut state = self.state.lock();
            let drained: Vec<(String, MessagesBatch)> = state.batches.drain().collect();
            for (key, mut batch) in drained {
                let outstanding = batch.pop_outstanding_batch();
                if key.is_empty() {
                    unordered.push(outstanding);
                } else {
                    self.submit_ordered(outstanding);
                }
            }
        }
        for batch in unordered {
            self.spawn_unordered(batch);
        }
    }

    fn spawn_unordered(self: &Arc<Self>, batch: OutstandingBatch) {
        let inner = self.clone();
        tokio::spawn(async move {
            let result = inner.send_batch(&batch).await;
            batch.settle(result, &inner.messages_waiter);
        });
    }

    /// Queues an ordered batch behind earlier batches for its key.
    ///
    /// The batch settles inside the queued job. If the key is paused before the job runs, the
    /// batch is settled here with the cancellation error instead.
    fn submit_ordered(self: &Arc<Self>, batch: OutstandingBatch) {
        let key = batch.ordering_key.clone();
        let slot = Arc::new(Mutex::new(Some(batch)));
        let job_slot = slot.clone();
        let inner = self.clone();
        let outcome = self.sequential.submit(&key, move || async move {
            let Some(batch) = job_slot.lock().take() else {
                return Ok(());
            };
            inner.publish_ordered_batch(batch).await
        });
        let inner = self.clone();
        tokio::spawn(async move {
            let _ = outcome.await;
            let unsent = slot.lock().take();
            if let Some(batch) = unsent {
                batch.settle(Err(PublishError::Cancelled), &inner.messages_waiter);
            }
        });
    }

    async fn publish_ordered_batch(self: &Arc<Self>, batch: OutstandingBatch) -> Result<(), PublishError> {
        let key = batch.ordering_key.clone();
        match self.send_batch(&batch).await {
            Ok(ids) => {
                batch.settle(Ok(ids), &self.messages_waiter);
                let mut state = self.state.lock();
                if state.alarm.is_none()
                    && let Some(mut open) = state.batches.remove(&key)
                {
                    let next = open.pop_outstanding_batch();
                    self.submit_ordered(next);
                }
                Ok(())
            }
            Err(err) => {
                let open = self
                    .state
                    .lock()
                    .batches
                    .remove(&key)
                    .map(|mut open| open.pop_outstanding_batch());
                if let Some(open) = open {
                    open.settle(Err(PublishError::Cancelled), &self.messages_waiter);
                }
                tracing::warn!(ordering_key = %key, error = %err, "ordered publish failed; pausing key");
                batch.settle(Err(err.clone()), &self.messages_waiter);
                Err(err)
            }
        }
    }

    /// Sends one batch, retrying retryable codes within the retry budget.
    async fn send_batch(&self, batch: &OutstandingBatch) -> Result<Vec<String>, PublishError> {
        let topic = self.config.topic.as_str();
        let count = batch.len();
        self.tracer.batching_end(&batch.ordering_key, count);
        let request = PublishRequest {
            topic: topic.to_string(),
            messages: batch
                .messages
                .iter()
                .map(|publish| publish.message.clone())
                .collect(),
            compress: self.config.enable_compression
                && batch.batch_bytes >= self.config.compression_bytes_threshold,
        };
        t_counter!("kestrel_publish_batches_total").increment(1);

        let retry = &self.retry;
        let start = self.clock.now();
        let mut attempt: u32 = 0;
        let mut retry_delay = retry.initial_retry_delay;
        let mut rpc_timeout = retry.initial_rpc_timeout;
        loop {
            attempt += 1;
            let elapsed = self.clock.now().saturating_duration_since(start);
            let attempt_timeout = match retry.total_timeout {
                Some(total) => rpc_timeout.min(total.saturating_sub(elapsed)),
                None => rpc_timeout,
            };
            self.tracer.publish_rpc_start(topic, count);
            let result =
                match tokio::time::timeout(attempt_timeout, self.transport.publish(request.clone()))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Status::new(
                        Code::DeadlineExceeded,
                        format!("publish rpc exceeded {attempt_timeout:?}"),
                    )),
                };
            let status = match result {
                Ok(response) => {
                    self.tracer.publish_rpc_end(topic, count, None);
                    if response.message_ids.len() != count {
                        t_counter!("kestrel_publish_failures_total").increment(count as u64);
                        return Err(PublishError::ResponseMismatch {
                            expected: count,
                            actual: response.message_ids.len(),
                        });
                    }
                    t_counter!("kestrel_publish_messages_total").increment(count as u64);
                    return Ok(response.message_ids);
                }
                Err(status) => status,
            };
            self.tracer.publish_rpc_end(topic, count, Some(&status));

            let attempts_left = retry.max_attempts == 0 || attempt < retry.max_attempts;
            let elapsed = self.clock.now().saturating_duration_since(start);
            let time_left = retry
                .total_timeout
                .is_none_or(|total| elapsed + retry_delay < total);
            if !(is_publish_retryable(status.code) && attempts_left && time_left) {
                t_counter!("kestrel_publish_failures_total").increment(count as u64);
                tracing::warn!(topic, attempt, status = %status, "publish failed");
                return Err(PublishError::Rpc(status));
            }
            t_counter!("kestrel_publish_retries_total").increment(1);
            tracing::debug!(topic, attempt, status = %status, delay = ?retry_delay, "retrying publish");
            tokio::time::sleep(retry_delay).await;
            retry_delay = retry_delay
                .mul_f64(retry.retry_delay_multiplier)
                .min(retry.max_retry_delay);
            rpc_timeout = rpc_timeout
                .mul_f64(retry.rpc_timeout_multiplier)
                .min(retry.max_rpc_timeout);
        }
    }
}
