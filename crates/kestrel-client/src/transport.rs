// Transport traits the runtime drives; implementations own channels, credentials and encoding.
use async_trait::async_trait;
use futures::stream::BoxStream;
use kestrel_wire::{
    AcknowledgeRequest, ModifyAckDeadlineRequest, PublishRequest, PublishResponse, Status,
    StreamingPullRequest, StreamingPullResponse,
};

#[async_trait]
pub trait PublisherTransport: Send + Sync + 'static {
    async fn publish(&self, request: PublishRequest) -> Result<PublishResponse, Status>;
}

pub type PullStream = BoxStream<'static, Result<StreamingPullResponse, Status>>;

#[async_trait]
pub trait SubscriberTransport: Send + Sync + 'static {
    /// Opens a streaming pull. The stream ends with `None` on a clean close or yields an `Err`
    /// when it breaks.
    async fn streaming_pull(&self, request: StreamingPullRequest) -> Result<PullStream, Status>;

    async fn acknowledge(&self, request: AcknowledgeRequest) -> Result<(), Status>;

    async fn modify_ack_deadline(&self, request: ModifyAckDeadlineRequest) -> Result<(), Status>;
}
