// Open batches per ordering key and the settled-once bookkeeping for a batch in flight.
use kestrel_wire::PubsubMessage;
use tokio::sync::oneshot;

use crate::config::BatchingSettings;
use crate::error::PublishError;
use crate::flow_control::FlowControlLease;
use crate::waiter::Waiter;

pub(crate) type PublishResult = Result<String, PublishError>;

/// One published message waiting for its batch to settle.
pub(crate) struct OutstandingPublish {
    pub(crate) message: PubsubMessage,
    pub(crate) size: usize,
    pub(crate) result_tx: oneshot::Sender<PublishResult>,
    pub(crate) lease: FlowControlLease,
}

/// A closed batch handed to the transport.
pub(crate) struct OutstandingBatch {
    pub(crate) ordering_key: String,
    pub(crate) messages: Vec<OutstandingPublish>,
    pub(crate) batch_bytes: usize,
}

impl OutstandingBatch {
    pub(crate) fn len(&self) -> usize {
        self.messages.len()
    }

    /// Settles every message; ids are matched positionally.
    pub(crate) fn settle(self, result: Result<Vec<String>, PublishError>, waiter: &Waiter) {
        let count = self.messages.len() as i64;
        match result {
            Ok(ids) => {
                for (publish, id) in self.messages.into_iter().zip(ids) {
                    let _ = publish.result_tx.send(Ok(id));
                    drop(publish.lease);
                }
            }
            Err(err) => {
                for publish in self.messages {
                    let _ = publish.result_tx.send(Err(err.clone()));
                    drop(publish.lease);
                }
            }
        }
        waiter.increment_pending_count(-count);
    }
}

/// The open batch for one ordering key (the empty key for unordered messages).
pub(crate) struct MessagesBatch {
    ordering_key: String,
    messages: Vec<OutstandingPublish>,
    batched_bytes: usize,
    // Request overhead every batch starts with.
    initial_bytes: usize,
    element_count_threshold: usize,
    request_byte_threshold: usize,
}

impl MessagesBatch {
    pub(crate) fn new(ordering_key: String, topic: &str, settings: &BatchingSettings) -> Self {
        Self {
            ordering_key,
            messages: Vec::new(),
            batched_bytes: topic.len(),
            initial_bytes: topic.len(),
            element_count_threshold: settings.element_count_threshold,
            request_byte_threshold: settings.request_byte_threshold,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Appends `publish` and returns any batches that became ready to send.
    ///
    /// A message that would carry a non-empty batch to the byte threshold closes the current batch
    /// first, so an oversized message always travels alone.
    pub(crate) fn add(&mut self, publish: OutstandingPublish) -> Vec<OutstandingBatch> {
        let mut ready = Vec::new();
        if !self.is_empty() && self.batched_bytes + publish.size >= self.request_byte_threshold {
            ready.push(self.pop_outstanding_batch());
        }
        self.batched_bytes += publish.size;
        self.messages.push(publish);
        if self.batched_bytes >= self.request_byte_threshold
            || self.messages.len() == self.element_count_threshold
        {
            ready.push(self.pop_outstanding_batch());
        }
        ready
    }

    pub(crate) fn pop_outstanding_batch(&mut self) -> OutstandingBatch {
        let batch = OutstandingBatch {
            ordering_key: self.ordering_key.clone(),
            messages: std::mem::take(&mut self.messages),
            batch_bytes: self.batched_bytes,
        };
        self.batched_bytes = self.initial_bytes;
        batch
    }
}
