// Admission control over outstanding element count and bytes.
//
// Each limit is a FIFO tokio semaphore, so blocked reservations are admitted in arrival order and a
// large reservation is never starved by a stream of small ones. A lease returns its permits on drop.
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::config::{FlowControlSettings, LimitExceededBehavior};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FlowControlError {
    #[error("flow control: max outstanding element count reached")]
    MaxOutstandingElements,
    #[error("flow control: max outstanding request bytes reached")]
    MaxOutstandingBytes,
    #[error("message of {size} bytes exceeds the flow control byte limit of {limit}")]
    MessageTooLarge { size: u64, limit: u64 },
    #[error("flow controller closed")]
    Closed,
}

struct Limit {
    semaphore: Arc<Semaphore>,
    max: u32,
}

impl Limit {
    fn new(max: u64) -> Self {
        // Semaphore acquisitions are u32-sized; larger budgets saturate.
        let max = u32::try_from(max).unwrap_or(u32::MAX);
        Self {
            semaphore: Arc::new(Semaphore::new(max as usize)),
            max,
        }
    }

    fn outstanding(&self) -> u64 {
        u64::from(self.max) - self.semaphore.available_permits() as u64
    }

    fn clamp(&self, requested: u64) -> u32 {
        u32::try_from(requested).unwrap_or(u32::MAX).min(self.max)
    }

    async fn acquire(&self, requested: u64) -> Result<OwnedSemaphorePermit, FlowControlError> {
        self.semaphore
            .clone()
            .acquire_many_owned(self.clamp(requested))
            .await
            .map_err(|_| FlowControlError::Closed)
    }

    fn try_acquire(
        &self,
        requested: u64,
        exhausted: FlowControlError,
    ) -> Result<OwnedSemaphorePermit, FlowControlError> {
        self.semaphore
            .clone()
            .try_acquire_many_owned(self.clamp(requested))
            .map_err(|err| match err {
                TryAcquireError::NoPermits => exhausted,
                TryAcquireError::Closed => FlowControlError::Closed,
            })
    }
}

/// Reserved capacity; released when dropped.
#[derive(Debug, Default)]
pub struct FlowControlLease {
    _elements: Option<OwnedSemaphorePermit>,
    _bytes: Option<OwnedSemaphorePermit>,
}

pub struct FlowController {
    behavior: LimitExceededBehavior,
    elements: Option<Limit>,
    bytes: Option<Limit>,
}

impl FlowController {
    pub fn new(settings: &FlowControlSettings) -> Self {
        let enabled = settings.limit_exceeded_behavior != LimitExceededBehavior::Ignore;
        Self {
            behavior: settings.limit_exceeded_behavior,
            elements: settings
                .max_outstanding_element_count
                .filter(|_| enabled)
                .map(Limit::new),
            bytes: settings
                .max_outstanding_request_bytes
                .filter(|_| enabled)
                .map(Limit::new),
        }
    }

    pub fn behavior(&self) -> LimitExceededBehavior {
        self.behavior
    }

    pub fn byte_limit(&self) -> Option<u64> {
        self.bytes.as_ref().map(|limit| u64::from(limit.max))
    }

    pub fn outstanding_elements(&self) -> u64 {
        self.elements.as_ref().map_or(0, Limit::outstanding)
    }

    pub fn outstanding_bytes(&self) -> u64 {
        self.bytes.as_ref().map_or(0, Limit::outstanding)
    }

    /// Reserves capacity for `elements` items totalling `bytes`.
    ///
    /// Under `Block` this waits in FIFO order; a request larger than a limit is clamped to the
    /// limit so it can still be admitted once everything else drains. Under `FailFast` it errors
    /// immediately when either budget is exhausted.
    pub async fn reserve(
        &self,
        elements: u64,
        bytes: u64,
    ) -> Result<FlowControlLease, FlowControlError> {
        match self.behavior {
            LimitExceededBehavior::Ignore => Ok(FlowControlLease::default()),
            LimitExceededBehavior::Block => {
                let elements = match &self.elements {
                    Some(limit) => Some(limit.acquire(elements).await?),
                    None => None,
                };
                let bytes = match &self.bytes {
                    Some(limit) => Some(limit.acquire(bytes).await?),
                    None => None,
                };
                Ok(FlowControlLease {
                    _elements: elements,
                    _bytes: bytes,
                })
            }
            LimitExceededBehavior::FailFast => {
                let elements = self
                    .elements
                    .as_ref()
                    .map(|limit| limit.try_acquire(elements, FlowControlError::MaxOutstandingElements))
                    .transpose()?;
                let bytes = self
                    .bytes
                    .as_ref()
                    .map(|limit| limit.try_acquire(bytes, FlowControlError::MaxOutstandingBytes))
                    .transpose()?;
                Ok(FlowControlLease {
                    _elements: elements,
                    _bytes: bytes,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings(behavior: LimitExceededBehavior, elements: u64, bytes: u64) -> FlowControlSettings {
        FlowControlSettings {
            max_outstanding_element_count: Some(elements),
            max_outstanding_request_bytes: Some(bytes),
            limit_exceeded_behavior: behavior,
        }
    }

    #[tokio::test]
    async fn fail_fast_rejects_when_exhausted() {
        let controller = FlowController::new(&settings(LimitExceededBehavior::FailFast, 2, 100));
        let first = controller.reserve(1, 60).await.expect("first");
        let err = controller.reserve(1, 60).await.expect_err("bytes exhausted");
        assert_eq!(err, FlowControlError::MaxOutstandingBytes);
        // The element permit taken by the failed attempt must have been returned.
        assert_eq!(controller.outstanding_elements(), 1);
        drop(first);
        assert_eq!(controller.outstanding_bytes(), 0);
        controller.reserve(1, 60).await.expect("after release");
    }

    #[tokio::test(start_paused = true)]
    async fn block_waits_for_release() {
        let controller = Arc::new(FlowController::new(&settings(
            LimitExceededBehavior::Block,
            1,
            1_000,
        )));
        let lease = controller.reserve(1, 10).await.expect("first");
        let waiting = tokio::spawn({
            let controller = controller.clone();
            async move { controller.reserve(1, 10).await.map(|_| ()) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());
        drop(lease);
        waiting.await.expect("join").expect("admitted");
    }

    #[tokio::test]
    async fn block_clamps_oversized_requests() {
        let controller = FlowController::new(&settings(LimitExceededBehavior::Block, 10, 100));
        let _lease = controller.reserve(1, 5_000).await.expect("clamped");
        assert_eq!(controller.outstanding_bytes(), 100);
    }

    #[tokio::test]
    async fn ignore_never_accounts() {
        let controller = FlowController::new(&settings(LimitExceededBehavior::Ignore, 1, 1));
        let _a = controller.reserve(5, 500).await.expect("a");
        let _b = controller.reserve(5, 500).await.expect("b");
        assert_eq!(controller.outstanding_elements(), 0);
        assert_eq!(controller.byte_limit(), None);
    }
}
