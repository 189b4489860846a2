// Scripted transports: replay canned replies and record every request for assertions.
use async_trait::async_trait;
use futures::StreamExt;
use kestrel_client::transport::{PublisherTransport, PullStream, SubscriberTransport};
use kestrel_wire::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, Status,
    StreamingPullRequest, StreamingPullResponse,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// One scripted reply to a publish RPC.
#[derive(Debug, Clone)]
pub enum PublishReply {
    /// Assign sequential ids ("1", "2", ...) to every message.
    Ok,
    /// Return exactly these ids, even if the count is wrong.
    Ids(Vec<String>),
    Fail(Status),
    /// Sleep, then assign sequential ids.
    Delay(Duration),
}

/// Publisher transport that answers from a script and falls back to [`PublishReply::Ok`].
pub struct ScriptedPublisher {
    script: Mutex<VecDeque<PublishReply>>,
    requests: Mutex<Vec<PublishRequest>>,
    request_count: watch::Sender<usize>,
    next_id: AtomicU64,
}

impl Default for ScriptedPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPublisher {
    pub fn new() -> Self {
        let (request_count, _) = watch::channel(0);
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            request_count,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn push(&self, reply: PublishReply) -> &Self {
        self.script.lock().push_back(reply);
        self
    }

    pub fn requests(&self) -> Vec<PublishRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        *self.request_count.borrow()
    }

    /// Payloads of every request, in arrival order, as UTF-8 strings.
    pub fn payloads(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .iter()
            .map(|request| {
                request
                    .messages
                    .iter()
                    .map(|m| String::from_utf8_lossy(&m.data).into_owned())
                    .collect()
            })
            .collect()
    }

    pub async fn wait_for_requests(&self, count: usize) {
        let mut rx = self.request_count.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    fn sequential_ids(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|_| self.next_id.fetch_add(1, Ordering::Relaxed).to_string())
            .collect()
    }
}

#[async_trait]
impl PublisherTransport for ScriptedPublisher {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, Status> {
        let count = request.messages.len();
        self.requests.lock().push(request);
        self.request_count.send_modify(|seen| *seen += 1);
        let reply = self.script.lock().pop_front().unwrap_or(PublishReply::Ok);
        match reply {
            PublishReply::Ok => Ok(PublishResponse {
                message_ids: self.sequential_ids(count),
            }),
            PublishReply::Ids(message_ids) => Ok(PublishResponse { message_ids }),
            PublishReply::Fail(status) => Err(status),
            PublishReply::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(PublishResponse {
                    message_ids: self.sequential_ids(count),
                })
            }
        }
    }
}

/// What one scripted stream does.
#[derive(Debug, Clone)]
pub enum StreamScript {
    /// Opening the stream fails with this status.
    OpenError(Status),
    /// Yields each item, then ends cleanly.
    ThenClose(Vec<Result<StreamingPullResponse, Status>>),
    /// Yields each item, then stays open until dropped.
    ThenHang(Vec<StreamingPullResponse>),
}

/// Subscriber transport that opens scripted streams and records ack traffic.
///
/// Once the stream script runs out, further opens return a stream that never yields.
pub struct ScriptedSubscriber {
    streams: Mutex<VecDeque<StreamScript>>,
    ack_replies: Mutex<VecDeque<Result<(), Status>>>,
    modack_replies: Mutex<VecDeque<Result<(), Status>>>,
    pull_requests: Mutex<Vec<StreamingPullRequest>>,
    acks: Mutex<Vec<AcknowledgeRequest>>,
    modacks: Mutex<Vec<ModifyAckDeadlineRequest>>,
    opens: watch::Sender<usize>,
    ack_calls: watch::Sender<usize>,
}

impl Default for ScriptedSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSubscriber {
    pub fn new() -> Self {
        Self {
            streams: Mutex::new(VecDeque::new()),
            ack_replies: Mutex::new(VecDeque::new()),
            modack_replies: Mutex::new(VecDeque::new()),
            pull_requests: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            modacks: Mutex::new(Vec::new()),
            opens: watch::channel(0).0,
            ack_calls: watch::channel(0).0,
        }
    }

    pub fn push_stream(&self, script: StreamScript) -> &Self {
        self.streams.lock().push_back(script);
        self
    }

    pub fn push_ack_reply(&self, reply: Result<(), Status>) -> &Self {
        self.ack_replies.lock().push_back(reply);
        self
    }

    pub fn push_modack_reply(&self, reply: Result<(), Status>) -> &Self {
        self.modack_replies.lock().push_back(reply);
        self
    }

    pub fn pull_requests(&self) -> Vec<StreamingPullRequest> {
        self.pull_requests.lock().clone()
    }

    pub fn acks(&self) -> Vec<AcknowledgeRequest> {
        self.acks.lock().clone()
    }

    /// Every acked id, flattened across requests.
    pub fn acked_ids(&self) -> Vec<String> {
        self.acks
            .lock()
            .iter()
            .flat_map(|request| request.ack_ids.iter().cloned())
            .collect()
    }

    pub fn modacks(&self) -> Vec<ModifyAckDeadlineRequest> {
        self.modacks.lock().clone()
    }

    pub async fn wait_for_opens(&self, count: usize) {
        let mut rx = self.opens.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }

    /// Waits until `count` acknowledge or modify-deadline RPCs have been made.
    pub async fn wait_for_ack_calls(&self, count: usize) {
        let mut rx = self.ack_calls.subscribe();
        let _ = rx.wait_for(|seen| *seen >= count).await;
    }
}

#[async_trait]
impl SubscriberTransport for ScriptedSubscriber {
    async fn streaming_pull(&self, request: StreamingPullRequest) -> Result<PullStream, Status> {
        self.pull_requests.lock().push(request);
        self.opens.send_modify(|seen| *seen += 1);
        let script = self.streams.lock().pop_front();
        match script {
            Some(StreamScript::OpenError(status)) => Err(status),
            Some(StreamScript::ThenClose(items)) => Ok(futures::stream::iter(items).boxed()),
            Some(StreamScript::ThenHang(items)) => Ok(futures::stream::iter(items.into_iter().map(Ok))
                .chain(futures::stream::pending())
                .boxed()),
            None => Ok(futures::stream::pending().boxed()),
        }
    }

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status> {
        self.acks.lock().push(request);
        self.ack_calls.send_modify(|seen| *seen += 1);
        self.ack_replies.lock().pop_front().unwrap_or(Ok(()))
    }

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status> {
        self.modacks.lock().push(request);
        self.ack_calls.send_modify(|seen| *seen += 1);
        self.modack_replies.lock().pop_front().unwrap_or(Ok(()))
    }
}
