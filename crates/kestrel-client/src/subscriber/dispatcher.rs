// Lease tracking, deadline extension, ack batching and exactly-once receipt handling.
//
// Every leased message lives in `pending` from receipt until it is acked, nacked or expires.
// Replies are queued and flushed together with receipt and extension modacks by the background
// job; under exactly-once delivery a message is only handed to user code after its receipt modack
// succeeds, and messages are admitted in receipt order.
use futures::future::BoxFuture;
use kestrel_wire::{DELIVERY_ATTEMPT_ATTRIBUTE, ReceivedMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::ack::{AckOutcome, AckProcessor, AckRequestData, ModackRequest};
use super::receiver::{AckReplyConsumer, AckReplyConsumerWithResponse, Receiver};
use crate::clock::Clock;
use crate::config::{
    ACK_EXPIRATION_PADDING, DEFAULT_MIN_ACK_EXTENSION_EXACTLY_ONCE, MAX_ACK_DEADLINE,
    MIN_ACK_DEADLINE, ShutdownMode, SubscriberConfig, SubscriberShutdownSettings,
};
use crate::distribution::Distribution;
use crate::error::AckResponse;
use crate::flow_control::{FlowControlLease, FlowController};
use crate::sequential::AutoExecutor;
use crate::tracer::{ProcessAction, PubsubTracer};
use crate::waiter::Waiter;

const PERCENTILE: f64 = 99.9;
const BACKGROUND_PERIOD: Duration = Duration::from_millis(100);
const INITIAL_ACK_LATENCY_SECONDS: u64 = 10;

/// Ack-latency histogram shared by every connection of one subscriber, seeded with the
/// broker's minimum deadline.
pub(crate) fn new_ack_latency_distribution() -> Distribution {
    let distribution = Distribution::new(MAX_ACK_DEADLINE.as_secs() as usize + 1);
    distribution.record(INITIAL_ACK_LATENCY_SECONDS);
    distribution
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckReply {
    Ack,
    Nack,
}

/// Carried by a consumer; routes its single reply back to the dispatcher.
pub(crate) struct AckHandler {
    dispatcher: Arc<MessageDispatcher>,
    data: Arc<AckRequestData>,
    received_at: Instant,
}

impl AckHandler {
    pub(crate) fn ack_id(&self) -> &str {
        &self.data.ack_id
    }

    pub(crate) fn reply(self, reply: AckReply) {
        self.dispatcher.on_reply(&self.data, self.received_at, reply);
    }
}

struct OutstandingMessage {
    received: ReceivedMessage,
    data: Arc<AckRequestData>,
    response_rx: Option<oneshot::Receiver<AckResponse>>,
    received_at: Instant,
    size: usize,
}

struct Lease {
    total_expiration: Instant,
    flow_lease: Option<FlowControlLease>,
    data: Arc<AckRequestData>,
}

/// Exactly-once message waiting for its receipt modack.
struct ReceiptEntry {
    ack_id: String,
    message: Option<OutstandingMessage>,
    completed: bool,
}

#[derive(Default)]
struct DispatchState {
    pending: HashMap<String, Lease>,
    pending_acks: Vec<Arc<AckRequestData>>,
    pending_nacks: Vec<Arc<AckRequestData>>,
    pending_receipts: Vec<Arc<AckRequestData>>,
    outstanding_receipts: VecDeque<ReceiptEntry>,
    terminated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModackKind {
    Nack,
    Receipt,
    Extension,
    ShutdownNack,
}

struct PendingModack {
    deadline_seconds: i32,
    kind: ModackKind,
    entries: Vec<Arc<AckRequestData>>,
}

pub(crate) struct DispatcherParts {
    pub(crate) receiver: Receiver,
    pub(crate) ack_processor: Arc<dyn AckProcessor>,
    pub(crate) flow_controller: Arc<FlowController>,
    pub(crate) ack_latency: Arc<Distribution>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) tracer: Arc<dyn PubsubTracer>,
}

pub struct MessageDispatcher {
    subscription: String,
    receiver: Receiver,
    ack_processor: Arc<dyn AckProcessor>,
    flow_controller: Arc<FlowController>,
    ack_latency: Arc<Distribution>,
    sequential: AutoExecutor,
    clock: Arc<dyn Clock>,
    tracer: Arc<dyn PubsubTracer>,
    max_ack_extension_period: Duration,
    min_extension_override: Option<Duration>,
    max_extension: Option<Duration>,
    state: Mutex<DispatchState>,
    messages_waiter: Waiter,
    exactly_once: AtomicBool,
    ordering: AtomicBool,
    message_deadline_seconds: AtomicU64,
    min_extension_seconds: AtomicU64,
    next_extension: Mutex<Option<Instant>>,
    nack_immediately: AtomicBool,
    stopped: AtomicBool,
    job_cancel: watch::Sender<bool>,
    job: Mutex<Option<JoinHandle<()>>>,
    delivery_tx: mpsc::UnboundedSender<Vec<OutstandingMessage>>,
    delivery_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<OutstandingMessage>>>>,
    delivery: Mutex<Option<JoinHandle<()>>>,
}

impl MessageDispatcher {
    pub(crate) fn new(config: &SubscriberConfig, parts: DispatcherParts) -> Arc<Self> {
        let (job_cancel, _) = watch::channel(false);
        let (delivery_tx, delivery_rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(Self {
            subscription: config.subscription.clone(),
            receiver: parts.receiver,
            ack_processor: parts.ack_processor,
            flow_controller: parts.flow_controller,
            ack_latency: parts.ack_latency,
            sequential: AutoExecutor::new(),
            clock: parts.clock,
            tracer: parts.tracer,
            max_ack_extension_period: config.max_ack_extension_period,
            min_extension_override: config.min_duration_per_ack_extension,
            max_extension: config.max_duration_per_ack_extension,
            state: Mutex::new(DispatchState::default()),
            messages_waiter: Waiter::new(),
            exactly_once: AtomicBool::new(false),
            ordering: AtomicBool::new(false),
            message_deadline_seconds: AtomicU64::new(MIN_ACK_DEADLINE.as_secs()),
            min_extension_seconds: AtomicU64::new(
                config
                    .min_duration_per_ack_extension
                    .map_or(0, |min| min.as_secs()),
            ),
            next_extension: Mutex::new(None),
            nack_immediately: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            job_cancel,
            job: Mutex::new(None),
            delivery_tx,
            delivery_rx: Mutex::new(Some(delivery_rx)),
            delivery: Mutex::new(None),
        });
        dispatcher.set_exactly_once_delivery(config.exactly_once_delivery);
        dispatcher
            .message_deadline_seconds
            .store(dispatcher.compute_deadline_seconds(), Ordering::Release);
        dispatcher
    }

    /// Starts the periodic extension/flush job and the exactly-once delivery loop.
    pub(crate) fn start(self: &Arc<Self>) {
        self.spawn_delivery_loop();
        self.spawn_background_job();
    }

    fn spawn_delivery_loop(self: &Arc<Self>) {
        let Some(mut rx) = self.delivery_rx.lock().take() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                dispatcher.process_batch(batch).await;
            }
        });
        *self.delivery.lock() = Some(handle);
    }

    fn spawn_background_job(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut cancel = self.job_cancel.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKGROUND_PERIOD);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.changed() => break,
                    _ = ticker.tick() => {}
                }
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                dispatcher.run_background_cycle().await;
            }
        });
        *self.job.lock() = Some(handle);
    }

    async fn run_background_cycle(&self) {
        let now = self.clock.now();
        let due = self.next_extension.lock().is_none_or(|at| now >= at);
        if due {
            let deadline = self.compute_deadline_seconds();
            self.message_deadline_seconds.store(deadline, Ordering::Release);
            self.extend_deadlines().await;
            let rearm = Duration::from_secs(deadline).saturating_sub(ACK_EXPIRATION_PADDING);
            *self.next_extension.lock() = Some(self.clock.now() + rearm);
        }
        self.process_outstanding_operations().await;
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    /// Number of leased messages not yet acked, nacked or expired.
    pub fn outstanding_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn message_deadline_seconds(&self) -> u64 {
        self.message_deadline_seconds.load(Ordering::Acquire)
    }

    pub fn exactly_once_delivery_enabled(&self) -> bool {
        self.exactly_once.load(Ordering::Acquire)
    }

    /// Switches exactly-once mode; the default minimum extension follows the mode unless the
    /// user configured one.
    pub fn set_exactly_once_delivery(&self, enabled: bool) {
        let previous = self.exactly_once.swap(enabled, Ordering::AcqRel);
        if self.min_extension_override.is_none() {
            let mut min = if enabled {
                DEFAULT_MIN_ACK_EXTENSION_EXACTLY_ONCE
            } else {
                Duration::ZERO
            };
            if let Some(max) = self.max_extension {
                min = min.min(max);
            }
            self.min_extension_seconds
                .store(min.as_secs(), Ordering::Release);
        }
        if previous != enabled {
            tracing::debug!(
                subscription = %self.subscription,
                enabled,
                "exactly-once delivery changed"
            );
            self.message_deadline_seconds
                .store(self.compute_deadline_seconds(), Ordering::Release);
        }
    }

    pub fn set_message_ordering(&self, enabled: bool) {
        self.ordering.store(enabled, Ordering::Release);
    }

    /// Deadline for the next extension: p99.9 ack latency, bounded by the per-extension limits and
    /// the broker's accepted range.
    pub fn compute_deadline_seconds(&self) -> u64 {
        let mut seconds = self.ack_latency.percentile(PERCENTILE);
        let min = self.min_extension_seconds.load(Ordering::Acquire);
        match self.max_extension {
            Some(max) if seconds > max.as_secs() => seconds = max.as_secs(),
            _ => seconds = seconds.max(min),
        }
        seconds.clamp(MIN_ACK_DEADLINE.as_secs(), MAX_ACK_DEADLINE.as_secs())
    }

    /// Registers a batch from the stream, sends receipt modacks and delivers what is admissible.
    ///
    /// Outside exactly-once delivery this waits for flow control, which back-pressures the stream.
    pub async fn process_received_messages(self: &Arc<Self>, messages: Vec<ReceivedMessage>) {
        if messages.is_empty() {
            return;
        }
        let now = self.clock.now();
        let total_expiration = now + self.max_ack_extension_period;
        let exactly_once = self.exactly_once.load(Ordering::Acquire);
        let mut ready = Vec::new();
        {
            let mut state = self.state.lock();
            for mut received in messages {
                if state.pending.contains_key(&received.ack_id) {
                    tracing::debug!(ack_id = %received.ack_id, "skipping duplicate delivery");
                    continue;
                }
                if received.delivery_attempt > 0 {
                    received.message.attributes.insert(
                        DELIVERY_ATTEMPT_ATTRIBUTE.to_string(),
                        received.delivery_attempt.to_string(),
                    );
                }
                self.tracer.subscribe_receive(
                    &self.subscription,
                    &received.ack_id,
                    received.delivery_attempt,
                );
                let (response_tx, response_rx) = if self.receiver.wants_response() {
                    let (tx, rx) = oneshot::channel();
                    (Some(tx), Some(rx))
                } else {
                    (None, None)
                };
                let data = Arc::new(AckRequestData::new(received.ack_id.clone(), response_tx));
                state.pending.insert(
                    received.ack_id.clone(),
                    Lease {
                        total_expiration,
                        flow_lease: None,
                        data: data.clone(),
                    },
                );
                self.messages_waiter.increment_pending_count(1);
                state.pending_receipts.push(data.clone());
                let ack_id = received.ack_id.clone();
                let message = OutstandingMessage {
                    size: received.message.serialized_size(),
                    received,
                    data,
                    response_rx,
                    received_at: now,
                };
                if exactly_once {
                    state.outstanding_receipts.push_back(ReceiptEntry {
                        ack_id,
                        message: Some(message),
                        completed: false,
                    });
                } else {
                    ready.push(message);
                }
            }
            t_gauge!("kestrel_subscriber_outstanding_messages").set(state.pending.len() as f64);
        }
        self.process_outstanding_operations().await;
        self.process_batch(ready).await;
    }

    async fn process_batch(self: &Arc<Self>, batch: Vec<OutstandingMessage>) {
        for message in batch {
            let lease = match self
                .flow_controller
                .reserve(1, message.size as u64)
                .await
            {
                Ok(lease) => lease,
                Err(err) => {
                    tracing::warn!(error = %err, "subscriber flow control unavailable");
                    FlowControlLease::default()
                }
            };
            let total_expiration = {
                let mut state = self.state.lock();
                match state.pending.get_mut(&message.data.ack_id) {
                    Some(entry) => {
                        entry.flow_lease = Some(lease);
                        entry.total_expiration
                    }
                    // Settled (expired or shut down) while waiting for admission.
                    None => continue,
                }
            };
            self.tracer
                .subscribe_admitted(&self.subscription, &message.data.ack_id);
            self.deliver(message, total_expiration);
        }
    }

    fn deliver(self: &Arc<Self>, message: OutstandingMessage, total_expiration: Instant) {
        let deadline = Duration::from_secs(self.message_deadline_seconds.load(Ordering::Acquire));
        if self.clock.now() > total_expiration + deadline {
            let mut state = self.state.lock();
            if self.forget_locked(&mut state, &message.data.ack_id) {
                self.record_expired(&message.data.ack_id);
            }
            return;
        }

        let OutstandingMessage {
            received,
            data,
            response_rx,
            received_at,
            ..
        } = message;
        let handler = AckHandler {
            dispatcher: self.clone(),
            data,
            received_at,
        };
        let message = received.message;
        let ordering_key = message.ordering_key.clone();
        let task: BoxFuture<'static, ()> = match &self.receiver {
            Receiver::Plain(receiver) => {
                let receiver = receiver.clone();
                let consumer = AckReplyConsumer::new(handler);
                Box::pin(async move { receiver.receive_message(message, consumer).await })
            }
            Receiver::WithAckResponse(receiver) => {
                let receiver = receiver.clone();
                let response_rx = response_rx.unwrap_or_else(|| oneshot::channel().1);
                let consumer = AckReplyConsumerWithResponse::new(handler, response_rx);
                Box::pin(async move { receiver.receive_message(message, consumer).await })
            }
        };
        if self.ordering.load(Ordering::Acquire) && !ordering_key.is_empty() {
            self.sequential.submit(&ordering_key, task);
        } else {
            tokio::spawn(task);
        }
    }

    fn on_reply(&self, data: &Arc<AckRequestData>, received_at: Instant, reply: AckReply) {
        if !data.claim_reply() {
            return;
        }
        let mut state = self.state.lock();
        if state.terminated {
            drop(state);
            tracing::debug!(ack_id = %data.ack_id, "reply after shutdown dropped");
            data.set_response(AckResponse::Other);
            return;
        }
        let action = match reply {
            AckReply::Ack => {
                if self.nack_immediately.load(Ordering::Acquire)
                    && self.exactly_once.load(Ordering::Acquire)
                {
                    drop(state);
                    data.set_response(AckResponse::Other);
                    return;
                }
                let elapsed = self.clock.now().saturating_duration_since(received_at);
                let latency = elapsed.as_secs_f64().ceil() as u64;
                self.ack_latency.record(latency);
                t_histogram!("kestrel_subscriber_ack_latency_seconds").record(latency as f64);
                state.pending_acks.push(data.clone());
                ProcessAction::Ack
            }
            AckReply::Nack => {
                state.pending_nacks.push(data.clone());
                ProcessAction::Nack
            }
        };
        self.forget_locked(&mut state, &data.ack_id);
        drop(state);
        self.tracer
            .subscribe_process_end(&self.subscription, &data.ack_id, action);
    }

    /// Drops a lease, releasing its flow control and waiter slot. Returns false if it was gone.
    fn forget_locked(&self, state: &mut DispatchState, ack_id: &str) -> bool {
        let Some(lease) = state.pending.remove(ack_id) else {
            return false;
        };
        drop(lease.flow_lease);
        self.messages_waiter.increment_pending_count(-1);
        t_gauge!("kestrel_subscriber_outstanding_messages").set(state.pending.len() as f64);
        true
    }

    fn record_expired(&self, ack_id: &str) {
        t_counter!("kestrel_subscriber_expirations_total").increment(1);
        self.tracer.subscribe_expired(&self.subscription, ack_id);
    }

    /// Extends every lease by the current message deadline.
    ///
    /// A lease whose extension budget ends before that deadline gets one last modack for the
    /// remaining whole seconds (at least 1) and is forgotten; one already past its budget is
    /// forgotten silently. Ids are grouped per deadline value, and nothing is sent when no lease
    /// needs extending.
    pub async fn extend_deadlines(&self) {
        let now = self.clock.now();
        let extension_seconds = self.message_deadline_seconds.load(Ordering::Acquire);
        let extended_until = now + Duration::from_secs(extension_seconds);
        let mut groups: BTreeMap<i32, Vec<Arc<AckRequestData>>> = BTreeMap::new();
        {
            let mut state = self.state.lock();
            let mut expired = Vec::new();
            for (ack_id, lease) in &state.pending {
                if lease.total_expiration > extended_until {
                    groups
                        .entry(extension_seconds as i32)
                        .or_default()
                        .push(lease.data.clone());
                    continue;
                }
                expired.push(ack_id.clone());
                if lease.total_expiration > now {
                    let remaining = lease
                        .total_expiration
                        .saturating_duration_since(now)
                        .as_secs()
                        .max(1);
                    groups
                        .entry(remaining as i32)
                        .or_default()
                        .push(lease.data.clone());
                }
            }
            for ack_id in expired {
                if self.forget_locked(&mut state, &ack_id) {
                    self.record_expired(&ack_id);
                }
            }
        }
        if groups.is_empty() {
            return;
        }
        let modacks = groups
            .into_iter()
            .map(|(deadline_seconds, entries)| PendingModack {
                deadline_seconds,
                kind: ModackKind::Extension,
                entries,
            })
            .collect();
        self.send_ack_operations(Vec::new(), modacks).await;
    }

    /// Flushes queued nacks, receipt modacks and acks.
    pub async fn process_outstanding_operations(&self) {
        self.flush_with(Vec::new()).await;
    }

    async fn flush_with(&self, mut modacks: Vec<PendingModack>) {
        let (acks, nacks, receipts) = {
            let mut state = self.state.lock();
            (
                std::mem::take(&mut state.pending_acks),
                std::mem::take(&mut state.pending_nacks),
                std::mem::take(&mut state.pending_receipts),
            )
        };
        if !nacks.is_empty() {
            modacks.push(PendingModack {
                deadline_seconds: 0,
                kind: ModackKind::Nack,
                entries: nacks,
            });
        }
        if !receipts.is_empty() && !self.nack_immediately.load(Ordering::Acquire) {
            modacks.push(PendingModack {
                deadline_seconds: self.message_deadline_seconds.load(Ordering::Acquire) as i32,
                kind: ModackKind::Receipt,
                entries: receipts,
            });
        }
        if acks.is_empty() && modacks.is_empty() {
            return;
        }
        self.send_ack_operations(acks, modacks).await;
    }

    async fn send_ack_operations(
        &self,
        acks: Vec<Arc<AckRequestData>>,
        modacks: Vec<PendingModack>,
    ) {
        let exactly_once = self.exactly_once.load(Ordering::Acquire);
        let ack_ids: Vec<String> = acks.iter().map(|data| data.ack_id.clone()).collect();
        let requests: Vec<ModackRequest> = modacks
            .iter()
            .map(|modack| ModackRequest {
                deadline_seconds: modack.deadline_seconds,
                ack_ids: modack
                    .entries
                    .iter()
                    .map(|data| data.ack_id.clone())
                    .collect(),
            })
            .collect();
        t_counter!("kestrel_subscriber_acks_total").increment(ack_ids.len() as u64);
        for modack in &modacks {
            match modack.kind {
                ModackKind::Nack | ModackKind::ShutdownNack => {
                    t_counter!("kestrel_subscriber_nacks_total").increment(modack.entries.len() as u64)
                }
                ModackKind::Receipt | ModackKind::Extension => {
                    t_counter!("kestrel_subscriber_modacks_total").increment(modack.entries.len() as u64)
                }
            }
        }

        let mut outcome = self
            .ack_processor
            .send_ack_operations(ack_ids, requests)
            .await;

        // Transient failures get exactly one more attempt, one ack id per modack request.
        let retry_acks: Vec<String> = acks
            .iter()
            .filter(|data| outcome.ack(&data.ack_id) == AckOutcome::Transient)
            .map(|data| data.ack_id.clone())
            .collect();
        let retry_modacks: Vec<ModackRequest> = modacks
            .iter()
            .flat_map(|modack| {
                let outcome = &outcome;
                modack
                    .entries
                    .iter()
                    .filter(move |data| outcome.modack(&data.ack_id) == AckOutcome::Transient)
                    .map(move |data| ModackRequest {
                        deadline_seconds: modack.deadline_seconds,
                        ack_ids: vec![data.ack_id.clone()],
                    })
            })
            .collect();
        if !retry_acks.is_empty() || !retry_modacks.is_empty() {
            tracing::debug!(
                acks = retry_acks.len(),
                modacks = retry_modacks.len(),
                "retrying transient ack failures"
            );
            let retry_modack_ids: Vec<String> = retry_modacks
                .iter()
                .flat_map(|request| request.ack_ids.iter().cloned())
                .collect();
            let retried = self
                .ack_processor
                .send_ack_operations(retry_acks.clone(), retry_modacks)
                .await;
            for ack_id in retry_acks {
                let result = final_outcome(retried.ack(&ack_id));
                outcome.acks.insert(ack_id, result);
            }
            for ack_id in retry_modack_ids {
                let result = final_outcome(retried.modack(&ack_id));
                outcome.modacks.insert(ack_id, result);
            }
        }

        for data in &acks {
            self.settle_reply(data, outcome.ack(&data.ack_id), exactly_once, "ack");
        }
        for modack in &modacks {
            for data in &modack.entries {
                let result = outcome.modack(&data.ack_id);
                match modack.kind {
                    ModackKind::Nack => self.settle_reply(data, result, exactly_once, "nack"),
                    ModackKind::Receipt => match (exactly_once, result) {
                        (true, AckOutcome::Success) => self.notify_ack_success(data),
                        (true, failed) => {
                            data.set_response(failure_response(failed));
                            self.notify_ack_failed(data);
                        }
                        (false, AckOutcome::Success) => {}
                        (false, failed) => {
                            tracing::warn!(ack_id = %data.ack_id, outcome = ?failed, "receipt modack failed")
                        }
                    },
                    ModackKind::Extension => {
                        if result == AckOutcome::Success {
                            continue;
                        }
                        tracing::warn!(ack_id = %data.ack_id, outcome = ?result, "deadline extension failed");
                        if exactly_once {
                            data.set_response(failure_response(result));
                            self.notify_ack_failed(data);
                        }
                    }
                    ModackKind::ShutdownNack => {
                        if result != AckOutcome::Success {
                            tracing::debug!(ack_id = %data.ack_id, outcome = ?result, "shutdown nack failed");
                        }
                    }
                }
            }
        }
    }

    fn settle_reply(
        &self,
        data: &AckRequestData,
        result: AckOutcome,
        exactly_once: bool,
        operation: &'static str,
    ) {
        if !exactly_once {
            if result != AckOutcome::Success {
                tracing::warn!(ack_id = %data.ack_id, operation, outcome = ?result, "ack operation failed");
            }
            data.set_response(AckResponse::Successful);
            return;
        }
        let response = match result {
            AckOutcome::Success => AckResponse::Successful,
            failed => failure_response(failed),
        };
        data.set_response(response);
    }

    /// Marks a receipt complete and admits the completed prefix in receipt order.
    fn notify_ack_success(&self, data: &AckRequestData) {
        let ready = {
            let mut state = self.state.lock();
            if let Some(entry) = state
                .outstanding_receipts
                .iter_mut()
                .find(|entry| entry.ack_id == data.ack_id)
            {
                entry.completed = true;
            }
            pop_completed_receipts(&mut state)
        };
        if !ready.is_empty() {
            let _ = self.delivery_tx.send(ready);
        }
    }

    fn notify_ack_failed(&self, data: &AckRequestData) {
        let ready = {
            let mut state = self.state.lock();
            state
                .outstanding_receipts
                .retain(|entry| entry.ack_id != data.ack_id);
            self.forget_locked(&mut state, &data.ack_id);
            pop_completed_receipts(&mut state)
        };
        if !ready.is_empty() {
            let _ = self.delivery_tx.send(ready);
        }
    }

    /// Applies the shutdown policy, then stops background work and flushes once. Idempotent.
    pub async fn stop(&self, settings: SubscriberShutdownSettings) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            subscription = %self.subscription,
            mode = ?settings.mode,
            outstanding = self.messages_waiter.pending_count(),
            "stopping dispatcher"
        );
        match settings.mode {
            ShutdownMode::WaitForProcessing => match settings.timeout {
                None => self.messages_waiter.wait_complete().await,
                Some(timeout) => {
                    if !self
                        .messages_waiter
                        .try_wait(timeout, self.clock.as_ref())
                        .await
                    {
                        tracing::warn!(
                            subscription = %self.subscription,
                            outstanding = self.messages_waiter.pending_count(),
                            "shutdown timeout elapsed; leaving outstanding messages to lapse"
                        );
                    }
                }
            },
            ShutdownMode::NackImmediately => {
                self.nack_immediately.store(true, Ordering::Release);
            }
        }
        self.stop_background_tasks().await;

        let shutdown_nacks = {
            let mut state = self.state.lock();
            state.terminated = true;
            if settings.mode == ShutdownMode::NackImmediately {
                state.outstanding_receipts.clear();
                let ack_ids: Vec<String> = state.pending.keys().cloned().collect();
                let mut entries = Vec::with_capacity(ack_ids.len());
                for ack_id in ack_ids {
                    if let Some(lease) = state.pending.get(&ack_id) {
                        entries.push(lease.data.clone());
                    }
                    self.forget_locked(&mut state, &ack_id);
                }
                entries
            } else {
                Vec::new()
            }
        };
        let extra = if shutdown_nacks.is_empty() {
            Vec::new()
        } else {
            vec![PendingModack {
                deadline_seconds: 0,
                kind: ModackKind::ShutdownNack,
                entries: shutdown_nacks,
            }]
        };
        self.flush_with(extra).await;
        tracing::debug!(subscription = %self.subscription, "dispatcher stopped");
    }

    async fn stop_background_tasks(&self) {
        let _ = self.job_cancel.send(true);
        let job = self.job.lock().take();
        if let Some(job) = job {
            let _ = job.await;
        }
        let delivery = self.delivery.lock().take();
        if let Some(delivery) = delivery {
            delivery.abort();
        }
    }
}

fn pop_completed_receipts(state: &mut DispatchState) -> Vec<OutstandingMessage> {
    let mut ready = Vec::new();
    while state
        .outstanding_receipts
        .front()
        .is_some_and(|entry| entry.completed)
    {
        if let Some(entry) = state.outstanding_receipts.pop_front()
            && let Some(message) = entry.message
        {
            ready.push(message);
        }
    }
    ready
}

/// A second transient failure is final.
fn final_outcome(outcome: AckOutcome) -> AckOutcome {
    match outcome {
        AckOutcome::Transient => AckOutcome::Failed(AckResponse::Other),
        other => other,
    }
}

fn failure_response(outcome: AckOutcome) -> AckResponse {
    match outcome {
        AckOutcome::Success => AckResponse::Successful,
        AckOutcome::Transient => AckResponse::Other,
        AckOutcome::Failed(response) => response,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::config::{FlowControlSettings, LimitExceededBehavior};
    use crate::tracer::NoopTracer;
    use async_trait::async_trait;
    use kestrel_wire::PubsubMessage;
    use crate::subscriber::ack::AckOperationsOutcome;

    type Call = (Vec<String>, Vec<ModackRequest>);

    #[derive(Default)]
    struct ScriptedAckProcessor {
        calls: Mutex<Vec<Call>>,
        outcomes: Mutex<VecDeque<AckOperationsOutcome>>,
    }

    impl ScriptedAckProcessor {
        fn push_outcome(&self, outcome: AckOperationsOutcome) {
            self.outcomes.lock().push_back(outcome);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AckProcessor for ScriptedAckProcessor {
        async fn send_ack_operations(
            &self,
            acks: Vec<String>,
            modacks: Vec<ModackRequest>,
        ) -> AckOperationsOutcome {
            self.calls.lock().push((acks, modacks));
            self.outcomes.lock().pop_front().unwrap_or_default()
        }
    }

    struct Fixture {
        dispatcher: Arc<MessageDispatcher>,
        processor: Arc<ScriptedAckProcessor>,
    }

    fn fixture(config: SubscriberConfig, receiver: Receiver, clock: Arc<dyn Clock>) -> Fixture {
        let processor = Arc::new(ScriptedAckProcessor::default());
        let flow_controller = Arc::new(FlowController::new(&FlowControlSettings {
            max_outstanding_element_count: Some(100),
            max_outstanding_request_bytes: Some(1_000_000),
            limit_exceeded_behavior: LimitExceededBehavior::Block,
        }));
        let dispatcher = MessageDispatcher::new(
            &config,
            DispatcherParts {
                receiver,
                ack_processor: processor.clone(),
                flow_controller,
                ack_latency: Arc::new(new_ack_latency_distribution()),
                clock,
                tracer: Arc::new(NoopTracer),
            },
        );
        Fixture {
            dispatcher,
            processor,
        }
    }

    fn collecting_receiver() -> (
        Receiver,
        mpsc::UnboundedReceiver<(PubsubMessage, AckReplyConsumer)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Receiver::plain(move |message: PubsubMessage, consumer: AckReplyConsumer| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((message, consumer));
            }
        });
        (receiver, rx)
    }

    fn responding_receiver() -> (
        Receiver,
        mpsc::UnboundedReceiver<(PubsubMessage, AckReplyConsumerWithResponse)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let receiver = Receiver::with_ack_response(
            move |message: PubsubMessage, consumer: AckReplyConsumerWithResponse| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send((message, consumer));
                }
            },
        );
        (receiver, rx)
    }

    fn received(ack_id: &str) -> ReceivedMessage {
        ReceivedMessage {
            ack_id: ack_id.to_string(),
            message: PubsubMessage::new(format!("payload-{ack_id}")),
            delivery_attempt: 0,
        }
    }

    fn modack(deadline_seconds: i32, ids: &[&str]) -> ModackRequest {
        ModackRequest {
            deadline_seconds,
            ack_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn receipt_modack_uses_message_deadline() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        assert_eq!(f.processor.calls(), vec![(vec![], vec![modack(10, &["a"])])]);
        let (message, _consumer) = messages.recv().await.expect("delivered");
        assert_eq!(message.data, bytes::Bytes::from("payload-a"));
    }

    #[tokio::test]
    async fn extension_is_clamped_to_the_remaining_budget() {
        let clock = ManualClock::new();
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(clock.clone()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _held = messages.recv().await.expect("delivered");

        clock.advance(Duration::from_secs(60 * 60) - Duration::from_secs(5));
        f.dispatcher.extend_deadlines().await;
        let calls = f.processor.calls();
        assert_eq!(calls.last(), Some(&(vec![], vec![modack(5, &["a"])])));

        // The clamped extension was the last one.
        f.dispatcher.extend_deadlines().await;
        assert_eq!(f.processor.calls().len(), calls.len());
        assert_eq!(f.dispatcher.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn expired_messages_are_given_up_without_rpc() {
        let clock = ManualClock::new();
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(clock.clone()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _held = messages.recv().await.expect("delivered");
        let before = f.processor.calls().len();

        clock.advance(Duration::from_secs(60 * 60));
        f.dispatcher.extend_deadlines().await;
        assert_eq!(f.processor.calls().len(), before);
        assert_eq!(f.dispatcher.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn extensions_are_grouped_by_deadline() {
        let clock = ManualClock::new();
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(clock.clone()));
        f.dispatcher
            .process_received_messages(vec![received("a"), received("b")])
            .await;
        let _a = messages.recv().await.expect("a");
        let _b = messages.recv().await.expect("b");

        f.dispatcher.extend_deadlines().await;
        let (acks, modacks) = f.processor.calls().pop().expect("extension call");
        assert!(acks.is_empty());
        assert_eq!(modacks.len(), 1);
        assert_eq!(modacks[0].deadline_seconds, 10);
        let mut ids = modacks[0].ack_ids.clone();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn duplicate_ack_ids_are_skipped() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _first = messages.recv().await.expect("first delivery");
        assert!(messages.try_recv().is_err());
        assert_eq!(f.dispatcher.outstanding_count(), 1);
        assert_eq!(f.processor.calls().len(), 1);
    }

    #[tokio::test]
    async fn delivery_attempt_becomes_an_attribute() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        let mut redelivered = received("a");
        redelivered.delivery_attempt = 3;
        f.dispatcher
            .process_received_messages(vec![redelivered, received("b")])
            .await;
        let mut attempts = Vec::new();
        for _ in 0..2 {
            let (message, consumer) = messages.recv().await.expect("delivered");
            attempts.push(message.delivery_attempt());
            consumer.ack();
        }
        attempts.sort();
        assert_eq!(attempts, vec![None, Some(3)]);
    }

    #[tokio::test]
    async fn acks_and_nacks_flush_once() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a"), received("b")])
            .await;
        for _ in 0..2 {
            let (message, consumer) = messages.recv().await.expect("delivered");
            if message.data == bytes::Bytes::from("payload-a") {
                consumer.ack();
            } else {
                consumer.nack();
            }
        }
        assert_eq!(f.dispatcher.outstanding_count(), 0);

        f.dispatcher.process_outstanding_operations().await;
        let (acks, modacks) = f.processor.calls().pop().expect("flush");
        assert_eq!(acks, vec!["a".to_string()]);
        assert_eq!(modacks, vec![modack(0, &["b"])]);

        let calls = f.processor.calls().len();
        f.dispatcher.process_outstanding_operations().await;
        assert_eq!(f.processor.calls().len(), calls);
    }

    #[tokio::test]
    async fn dropped_consumer_nacks() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let (_message, consumer) = messages.recv().await.expect("delivered");
        drop(consumer);
        f.dispatcher.process_outstanding_operations().await;
        let (_, modacks) = f.processor.calls().pop().expect("flush");
        assert_eq!(modacks, vec![modack(0, &["a"])]);
    }

    #[tokio::test]
    async fn exactly_once_classifies_and_retries_transient_acks_once() {
        let mut config = SubscriberConfig::new("s");
        config.exactly_once_delivery = true;
        let (receiver, mut messages) = responding_receiver();
        let f = fixture(config, receiver, Arc::new(ManualClock::new()));
        f.dispatcher.spawn_delivery_loop();

        f.dispatcher
            .process_received_messages(vec![received("a"), received("b"), received("c"), received("d")])
            .await;
        // Receipts use the exactly-once minimum extension.
        assert_eq!(
            f.processor.calls()[0],
            (vec![], vec![modack(60, &["a", "b", "c", "d"])])
        );

        let mut responses = Vec::new();
        for _ in 0..4 {
            let (message, consumer) = messages.recv().await.expect("delivered");
            responses.push((message.data.clone(), tokio::spawn(consumer.ack())));
        }

        let mut first = AckOperationsOutcome::default();
        first
            .acks
            .insert("b".into(), AckOutcome::Failed(AckResponse::Invalid));
        first.acks.insert("c".into(), AckOutcome::Transient);
        first.acks.insert("d".into(), AckOutcome::Transient);
        f.processor.push_outcome(first);
        let mut retry = AckOperationsOutcome::default();
        retry.acks.insert("d".into(), AckOutcome::Transient);
        f.processor.push_outcome(retry);

        f.dispatcher.process_outstanding_operations().await;

        let calls = f.processor.calls();
        assert_eq!(calls.len(), 3);
        let mut retried = calls[2].0.clone();
        retried.sort();
        assert_eq!(retried, vec!["c".to_string(), "d".to_string()]);

        let mut settled = Vec::new();
        for (data, handle) in responses {
            settled.push((data, handle.await.expect("join")));
        }
        settled.sort_by(|a, b| a.0.cmp(&b.0));
        let responses: Vec<AckResponse> = settled.into_iter().map(|(_, r)| r).collect();
        assert_eq!(
            responses,
            vec![
                AckResponse::Successful,
                AckResponse::Invalid,
                AckResponse::Successful,
                AckResponse::Other,
            ]
        );
    }

    #[tokio::test]
    async fn exactly_once_failed_receipt_is_not_delivered() {
        let mut config = SubscriberConfig::new("s");
        config.exactly_once_delivery = true;
        let (receiver, mut messages) = responding_receiver();
        let f = fixture(config, receiver, Arc::new(ManualClock::new()));
        f.dispatcher.spawn_delivery_loop();

        let mut outcome = AckOperationsOutcome::default();
        outcome
            .modacks
            .insert("a".into(), AckOutcome::Failed(AckResponse::FailedPrecondition));
        f.processor.push_outcome(outcome);
        f.dispatcher
            .process_received_messages(vec![received("a"), received("b")])
            .await;

        let (message, _consumer) = messages.recv().await.expect("b delivered");
        assert_eq!(message.data, bytes::Bytes::from("payload-b"));
        assert!(messages.try_recv().is_err());
        assert_eq!(f.dispatcher.outstanding_count(), 1);
    }

    #[tokio::test]
    async fn deadline_respects_extension_bounds() {
        let (receiver, _messages) = collecting_receiver();
        let mut config = SubscriberConfig::new("s");
        config.max_duration_per_ack_extension = Some(Duration::from_secs(30));
        let f = fixture(config, receiver, Arc::new(ManualClock::new()));
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 10);
        // Exactly-once raises the floor to 60s, capped by the configured maximum.
        f.dispatcher.set_exactly_once_delivery(true);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 30);
        f.dispatcher.set_exactly_once_delivery(false);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 10);

        let (receiver, _messages) = collecting_receiver();
        let mut config = SubscriberConfig::new("s");
        config.min_duration_per_ack_extension = Some(Duration::from_secs(45));
        let f = fixture(config, receiver, Arc::new(ManualClock::new()));
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 45);
        f.dispatcher.set_exactly_once_delivery(true);
        assert_eq!(f.dispatcher.compute_deadline_seconds(), 45);
    }

    #[tokio::test]
    async fn nack_immediately_nacks_outstanding_messages() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _held = messages.recv().await.expect("delivered");
        f.dispatcher
            .stop(SubscriberShutdownSettings {
                mode: ShutdownMode::NackImmediately,
                timeout: None,
            })
            .await;
        let (_, modacks) = f.processor.calls().pop().expect("shutdown flush");
        assert_eq!(modacks, vec![modack(0, &["a"])]);
        assert_eq!(f.dispatcher.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn ack_during_nack_immediately_shutdown_resolves_other() {
        let mut config = SubscriberConfig::new("s");
        config.exactly_once_delivery = true;
        let (receiver, mut messages) = responding_receiver();
        let f = fixture(config, receiver, Arc::new(ManualClock::new()));
        f.dispatcher.spawn_delivery_loop();
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let (_message, consumer) = messages.recv().await.expect("delivered");
        f.dispatcher
            .stop(SubscriberShutdownSettings {
                mode: ShutdownMode::NackImmediately,
                timeout: None,
            })
            .await;
        assert_eq!(consumer.ack().await, AckResponse::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_processing_honors_timeout() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(SystemClock));
        f.dispatcher.start();
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _held = messages.recv().await.expect("delivered");

        let start = Instant::now();
        f.dispatcher
            .stop(SubscriberShutdownSettings {
                mode: ShutdownMode::WaitForProcessing,
                timeout: Some(Duration::from_secs(5)),
            })
            .await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "returned after {elapsed:?}");
        assert!(elapsed < Duration::from_secs(6), "returned after {elapsed:?}");
        // Not force-nacked.
        assert_eq!(f.dispatcher.outstanding_count(), 1);
        assert!(
            f.processor
                .calls()
                .iter()
                .all(|(_, modacks)| modacks.iter().all(|m| m.deadline_seconds != 0))
        );
    }

    #[tokio::test]
    async fn zero_timeout_returns_immediately() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(ManualClock::new()));
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let _held = messages.recv().await.expect("delivered");
        tokio::time::timeout(
            Duration::from_secs(1),
            f.dispatcher.stop(SubscriberShutdownSettings {
                mode: ShutdownMode::WaitForProcessing,
                timeout: Some(Duration::ZERO),
            }),
        )
        .await
        .expect("stop returned");
    }

    #[tokio::test(start_paused = true)]
    async fn background_job_flushes_acks() {
        let (receiver, mut messages) = collecting_receiver();
        let f = fixture(SubscriberConfig::new("s"), receiver, Arc::new(SystemClock));
        f.dispatcher.start();
        f.dispatcher
            .process_received_messages(vec![received("a")])
            .await;
        let (_message, consumer) = messages.recv().await.expect("delivered");
        consumer.ack();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(
            f.processor
                .calls()
                .iter()
                .any(|(acks, _)| acks == &vec!["a".to_string()])
        );
        f.dispatcher
            .stop(SubscriberShutdownSettings::default())
            .await;
    }
}
