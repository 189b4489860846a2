// Ack/modack operations exchanged between the dispatcher and the connection.
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

use crate::error::AckResponse;

/// A deadline modification for a group of ack ids. Zero seconds nacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModackRequest {
    pub deadline_seconds: i32,
    pub ack_ids: Vec<String>,
}

/// Per-ack-id result of an ack or modack RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Success,
    /// May succeed if retried.
    Transient,
    Failed(AckResponse),
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AckOperationsOutcome {
    pub acks: HashMap<String, AckOutcome>,
    pub modacks: HashMap<String, AckOutcome>,
}

impl AckOperationsOutcome {
    /// Ids missing from the outcome are treated as successful.
    pub fn ack(&self, ack_id: &str) -> AckOutcome {
        self.acks.get(ack_id).copied().unwrap_or(AckOutcome::Success)
    }

    pub fn modack(&self, ack_id: &str) -> AckOutcome {
        self.modacks
            .get(ack_id)
            .copied()
            .unwrap_or(AckOutcome::Success)
    }
}

#[async_trait]
pub trait AckProcessor: Send + Sync + 'static {
    async fn send_ack_operations(
        &self,
        acks: Vec<String>,
        modacks: Vec<ModackRequest>,
    ) -> AckOperationsOutcome;
}

/// Reply state shared between a leased message, its consumer and pending ack operations.
#[derive(Debug)]
pub(crate) struct AckRequestData {
    pub(crate) ack_id: String,
    replied: AtomicBool,
    response_tx: Mutex<Option<oneshot::Sender<AckResponse>>>,
}

impl AckRequestData {
    pub(crate) fn new(ack_id: String, response_tx: Option<oneshot::Sender<AckResponse>>) -> Self {
        Self {
            ack_id,
            replied: AtomicBool::new(false),
            response_tx: Mutex::new(response_tx),
        }
    }

    /// True for the first caller only.
    pub(crate) fn claim_reply(&self) -> bool {
        !self.replied.swap(true, Ordering::AcqRel)
    }

    /// Resolves the caller-visible response; later calls are ignored.
    pub(crate) fn set_response(&self, response: AckResponse) {
        if let Some(tx) = self.response_tx.lock().take() {
            let _ = tx.send(response);
        }
    }
}
