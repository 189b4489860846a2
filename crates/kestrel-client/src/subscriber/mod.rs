// Subscriber: parallel streaming pulls feeding per-stream dispatchers, plus lifecycle.
mod ack;
mod connection;
mod dispatcher;
mod receiver;

pub use ack::{AckOperationsOutcome, AckOutcome, AckProcessor, ModackRequest};
pub use dispatcher::MessageDispatcher;
pub use receiver::{
    AckReplyConsumer, AckReplyConsumerWithResponse, MessageReceiver,
    MessageReceiverWithAckResponse, Receiver,
};

use futures::FutureExt;
use futures::future::{BoxFuture, join_all, select_all};
use kestrel_wire::Status;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::clock::{Clock, SystemClock};
use crate::config::{FlowControlSettings, LimitExceededBehavior, SubscriberConfig};
use crate::error::SubscriberError;
use crate::flow_control::FlowController;
use crate::tracer::{NoopTracer, PubsubTracer};
use crate::transport::SubscriberTransport;
use connection::{StreamAckProcessor, StreamingSubscriberConnection};
use dispatcher::{DispatcherParts, new_ack_latency_distribution};

/// Lifecycle of a [`Subscriber`]. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    New,
    Running,
    Stopping,
    Terminated,
    Failed,
}

impl SubscriberState {
    fn is_terminal(self) -> bool {
        matches!(self, SubscriberState::Terminated | SubscriberState::Failed)
    }
}

#[derive(Clone)]
pub struct Subscriber {
    pub(crate) inner: Arc<SubscriberInner>,
}

pub(crate) struct SubscriberInner {
    config: SubscriberConfig,
    receiver: Receiver,
    transport: Arc<dyn SubscriberTransport>,
    tracer: Arc<dyn PubsubTracer>,
    clock: Arc<dyn Clock>,
    state: watch::Sender<SubscriberState>,
    failure: Mutex<Option<SubscriberError>>,
    connections: Mutex<Vec<Arc<StreamingSubscriberConnection>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

pub struct SubscriberBuilder {
    config: SubscriberConfig,
    transport: Arc<dyn SubscriberTransport>,
    receiver: Receiver,
    tracer: Arc<dyn PubsubTracer>,
    clock: Arc<dyn Clock>,
}

impl SubscriberBuilder {
    pub fn tracer(mut self, tracer: Arc<dyn PubsubTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<Subscriber, SubscriberError> {
        self.config.validate()?;
        let (state, _) = watch::channel(SubscriberState::New);
        Ok(Subscriber {
            inner: Arc::new(SubscriberInner {
                config: self.config,
                receiver: self.receiver,
                transport: self.transport,
                tracer: self.tracer,
                clock: self.clock,
                state,
                failure: Mutex::new(None),
                connections: Mutex::new(Vec::new()),
                monitor: Mutex::new(None),
            }),
        })
    }
}

impl Subscriber {
    pub fn builder(
        config: SubscriberConfig,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Receiver,
    ) -> SubscriberBuilder {
        SubscriberBuilder {
            config,
            transport,
            receiver,
            tracer: Arc::new(NoopTracer),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn new(
        config: SubscriberConfig,
        transport: Arc<dyn SubscriberTransport>,
        receiver: Receiver,
    ) -> Result<Self, SubscriberError> {
        Self::builder(config, transport, receiver).build()
    }

    pub fn subscription(&self) -> &str {
        &self.inner.config.subscription
    }

    pub fn state(&self) -> SubscriberState {
        *self.inner.state.borrow()
    }

    /// The error that moved the subscriber to `Failed`, if any.
    pub fn failure_cause(&self) -> Option<SubscriberError> {
        self.inner.failure.lock().clone()
    }

    /// Opens `parallel_pull_count` streams sharing one flow controller and ack-latency history.
    pub fn start(&self) -> Result<(), SubscriberError> {
        let inner = &self.inner;
        let started = inner.state.send_if_modified(|state| {
            if *state == SubscriberState::New {
                *state = SubscriberState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(SubscriberError::AlreadyStarted);
        }

        let config = &inner.config;
        let flow_controller = Arc::new(FlowController::new(&FlowControlSettings {
            limit_exceeded_behavior: LimitExceededBehavior::Block,
            ..config.flow_control.clone()
        }));
        let ack_latency = Arc::new(new_ack_latency_distribution());

        let mut connections = Vec::with_capacity(config.parallel_pull_count);
        for channel in 0..config.parallel_pull_count {
            let ack_processor = Arc::new(StreamAckProcessor::new(
                inner.transport.clone(),
                config.subscription.clone(),
            ));
            let dispatcher = MessageDispatcher::new(
                config,
                DispatcherParts {
                    receiver: inner.receiver.clone(),
                    ack_processor,
                    flow_controller: flow_controller.clone(),
                    ack_latency: ack_latency.clone(),
                    clock: inner.clock.clone(),
                    tracer: inner.tracer.clone(),
                },
            );
            let connection = StreamingSubscriberConnection::new(
                config.clone(),
                channel,
                inner.transport.clone(),
                dispatcher,
            );
            connection.start();
            connections.push(connection);
        }

        let failures: Vec<_> = connections.iter().map(|c| c.failure()).collect();
        *inner.connections.lock() = connections;
        let monitored = self.inner.clone();
        *inner.monitor.lock() = Some(tokio::spawn(async move {
            let status = first_failure(failures).await;
            monitored.on_failure(status).await;
        }));
        tracing::info!(
            subscription = %config.subscription,
            streams = config.parallel_pull_count,
            "subscriber started"
        );
        Ok(())
    }

    /// Stops every stream using the configured shutdown settings and waits for termination.
    ///
    /// Safe to call repeatedly and concurrently; later callers wait for the first to finish.
    pub async fn stop(&self) {
        let inner = &self.inner;
        let mut run_shutdown = false;
        inner.state.send_if_modified(|state| match *state {
            SubscriberState::New => {
                *state = SubscriberState::Terminated;
                true
            }
            SubscriberState::Running => {
                *state = SubscriberState::Stopping;
                run_shutdown = true;
                true
            }
            _ => false,
        });
        if run_shutdown {
            tracing::info!(subscription = %inner.config.subscription, "subscriber stopping");
            inner.shutdown_connections().await;
            inner.finish();
        }
        // Never `New` here: the transition above left it.
        let _ = self.await_terminated().await;
    }

    /// Waits until the subscriber is `Terminated` or `Failed`.
    ///
    /// A subscriber that was never started has nothing to wait for and returns `NotRunning`.
    pub async fn await_terminated(&self) -> Result<SubscriberState, SubscriberError> {
        let mut state = self.inner.state.subscribe();
        if *state.borrow_and_update() == SubscriberState::New {
            return Err(SubscriberError::NotRunning);
        }
        match state.wait_for(|state| state.is_terminal()).await {
            Ok(state) => Ok(*state),
            Err(_) => Ok(self.state()),
        }
    }
}

impl SubscriberInner {
    async fn shutdown_connections(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        let settings = self.config.shutdown;
        join_all(connections.iter().map(|c| c.stop(settings))).await;
    }

    fn finish(&self) {
        let failed = self.failure.lock().is_some();
        let terminal = if failed {
            SubscriberState::Failed
        } else {
            SubscriberState::Terminated
        };
        self.state.send_replace(terminal);
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        tracing::info!(
            subscription = %self.config.subscription,
            state = ?terminal,
            "subscriber terminated"
        );
    }

    async fn on_failure(&self, status: Status) {
        self.failure
            .lock()
            .get_or_insert(SubscriberError::Stream(status));
        let mut run_shutdown = false;
        self.state.send_if_modified(|state| {
            if *state == SubscriberState::Running {
                *state = SubscriberState::Stopping;
                run_shutdown = true;
                true
            } else {
                false
            }
        });
        if run_shutdown {
            self.shutdown_connections().await;
            // This task is the monitor, so its handle is left in place.
            self.state.send_replace(SubscriberState::Failed);
            tracing::error!(subscription = %self.config.subscription, "subscriber failed");
        }
    }
}

/// Resolves with the first fatal stream error among `failures`; pends forever if none fail.
fn first_failure(failures: Vec<watch::Receiver<Option<Status>>>) -> BoxFuture<'static, Status> {
    let waits: Vec<BoxFuture<'static, Status>> = failures
        .into_iter()
        .map(|mut rx| {
            async move {
                let failed = match rx.wait_for(Option::is_some).await {
                    Ok(status) => (*status).clone(),
                    Err(_) => None,
                };
                match failed {
                    Some(status) => status,
                    None => futures::future::pending().await,
                }
            }
            .boxed()
        })
        .collect();
    if waits.is_empty() {
        return futures::future::pending().boxed();
    }
    select_all(waits).map(|(status, _, _)| status).boxed()
}
