// Per-key sequential task queues.
//
// Tasks sharing a key run one at a time in submission order on a drain task spawned for that key;
// distinct keys run concurrently. A key's queue is dropped as soon as it empties.
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::Cancelled;

struct QueuedTask {
    /// Resolves to whether the task succeeded.
    run: Box<dyn FnOnce() -> BoxFuture<'static, bool> + Send>,
    cancel: Box<dyn FnOnce() + Send>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<QueuedTask>>,
    failed: HashSet<String>,
}

struct Inner {
    state: Mutex<State>,
    poison_on_failure: bool,
}

impl Inner {
    fn new(poison_on_failure: bool) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State::default()),
            poison_on_failure,
        })
    }

    fn submit(self: &Arc<Self>, key: &str, task: QueuedTask) {
        let mut state = self.state.lock();
        if self.poison_on_failure && state.failed.contains(key) {
            drop(state);
            (task.cancel)();
            return;
        }
        match state.queues.get_mut(key) {
            Some(queue) => queue.push_back(task),
            None => {
                state
                    .queues
                    .insert(key.to_string(), VecDeque::from([task]));
                drop(state);
                tokio::spawn(self.clone().drain(key.to_string()));
            }
        }
    }

    async fn drain(self: Arc<Self>, key: String) {
        loop {
            let task = {
                let mut state = self.state.lock();
                if self.poison_on_failure && state.failed.contains(&key) {
                    let cancelled = state.queues.remove(&key).unwrap_or_default();
                    drop(state);
                    cancelled.into_iter().for_each(|task| (task.cancel)());
                    return;
                }
                let Some(queue) = state.queues.get_mut(&key) else {
                    return;
                };
                match queue.pop_front() {
                    Some(task) => task,
                    None => {
                        state.queues.remove(&key);
                        return;
                    }
                }
            };
            let succeeded = (task.run)().await;
            if !succeeded && self.poison_on_failure {
                tracing::debug!(key = %key, "sequential task failed; pausing key");
                self.state.lock().failed.insert(key.clone());
            }
        }
    }
}

/// Runs futures in order per key. Failures never affect later tasks.
#[derive(Clone)]
pub struct AutoExecutor {
    inner: Arc<Inner>,
}

impl AutoExecutor {
    pub fn new() -> Self {
        Self {
            inner: Inner::new(false),
        }
    }

    pub fn submit<F>(&self, key: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.submit(
            key,
            QueuedTask {
                run: Box::new(move || {
                    Box::pin(async move {
                        future.await;
                        true
                    })
                }),
                cancel: Box::new(|| {}),
            },
        );
    }
}

impl Default for AutoExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// Runs fallible tasks in order per key; the first failure pauses the key.
///
/// While a key is paused, queued and newly submitted tasks resolve with `E::from(Cancelled)`
/// without running until [`CallbackExecutor::resume_publish`] is called.
#[derive(Clone)]
pub struct CallbackExecutor {
    inner: Arc<Inner>,
}

impl CallbackExecutor {
    pub fn new() -> Self {
        Self {
            inner: Inner::new(true),
        }
    }

    /// Queues `task` behind earlier work for `key`. The task is enqueued immediately; the returned
    /// future only observes its outcome.
    pub fn submit<F, Fut, T, E>(
        &self,
        key: &str,
        task: F,
    ) -> impl Future<Output = Result<T, E>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: From<Cancelled> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel::<Result<T, E>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let cancel_slot = slot.clone();
        self.inner.submit(
            key,
            QueuedTask {
                run: Box::new(move || {
                    Box::pin(async move {
                        let result = task().await;
                        let succeeded = result.is_ok();
                        if let Some(tx) = slot.lock().take() {
                            let _ = tx.send(result);
                        }
                        succeeded
                    })
                }),
                cancel: Box::new(move || {
                    if let Some(tx) = cancel_slot.lock().take() {
                        let _ = tx.send(Err(E::from(Cancelled)));
                    }
                }),
            },
        );
        async move { rx.await.unwrap_or_else(|_| Err(E::from(Cancelled))) }
    }

    /// Pauses `key` as if a task had failed.
    pub fn stop_publish(&self, key: &str) {
        self.inner.state.lock().failed.insert(key.to_string());
    }

    pub fn resume_publish(&self, key: &str) {
        self.inner.state.lock().failed.remove(key);
    }

    pub fn key_has_error(&self, key: &str) -> bool {
        self.inner.state.lock().failed.contains(key)
    }

    /// Whether `key` has a task running or queued.
    pub fn has_tasks_inflight(&self, key: &str) -> bool {
        self.inner.state.lock().queues.contains_key(key)
    }
}

impl Default for CallbackExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed,
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_runs_in_submission_order() {
        let executor = AutoExecutor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for (index, delay) in [(0, 30), (1, 10), (2, 0)] {
            let tx = tx.clone();
            executor.submit("k", async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                let _ = tx.send(index);
            });
        }
        drop(tx);
        let mut seen = Vec::new();
        while let Some(index) = rx.recv().await {
            seen.push(index);
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_keys_run_concurrently() {
        let executor = AutoExecutor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let slow = tx.clone();
        executor.submit("a", async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            let _ = slow.send("a");
        });
        executor.submit("b", async move {
            let _ = tx.send("b");
        });
        assert_eq!(rx.recv().await, Some("b"));
        assert_eq!(rx.recv().await, Some("a"));
    }

    #[tokio::test]
    async fn failure_cancels_queued_and_later_tasks_until_resume() {
        let executor = CallbackExecutor::new();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let first = executor.submit("k", move || async move {
            let _ = gate_rx.await;
            Err::<u32, _>(TestError::Failed)
        });
        let queued = executor.submit("k", || async { Ok::<_, TestError>(2) });
        let other_key = executor.submit("other", || async { Ok::<_, TestError>(3) });
        assert!(executor.has_tasks_inflight("k"));

        let _ = gate_tx.send(());
        assert_eq!(first.await, Err(TestError::Failed));
        assert_eq!(queued.await, Err(TestError::Cancelled));
        assert_eq!(other_key.await, Ok(3));
        assert!(executor.key_has_error("k"));

        let rejected = executor.submit("k", || async { Ok::<_, TestError>(4) });
        assert_eq!(rejected.await, Err(TestError::Cancelled));

        executor.resume_publish("k");
        assert!(!executor.key_has_error("k"));
        let resumed = executor.submit("k", || async { Ok::<_, TestError>(5) });
        assert_eq!(resumed.await, Ok(5));
    }

    #[tokio::test]
    async fn stop_publish_pauses_key_explicitly() {
        let executor = CallbackExecutor::new();
        executor.stop_publish("k");
        let result = executor.submit("k", || async { Ok::<_, TestError>(1) }).await;
        assert_eq!(result, Err(TestError::Cancelled));
    }

    #[tokio::test]
    async fn idle_keys_are_dropped() {
        let executor = CallbackExecutor::new();
        executor
            .submit("k", || async { Ok::<_, TestError>(()) })
            .await
            .expect("ok");
        for _ in 0..10 {
            if !executor.has_tasks_inflight("k") {
                return;
            }
            tokio::task::yield_now().await;
        }
        panic!("queue for idle key was not removed");
    }
}
