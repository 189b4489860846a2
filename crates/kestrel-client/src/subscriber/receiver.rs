// User callback contracts and the ack/nack handles passed to them.
use async_trait::async_trait;
use kestrel_wire::PubsubMessage;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;

use super::dispatcher::{AckHandler, AckReply};
use crate::error::AckResponse;

/// Receives messages and replies through an [`AckReplyConsumer`].
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    async fn receive_message(&self, message: PubsubMessage, consumer: AckReplyConsumer);
}

/// Receives messages and can observe the broker's confirmation of each reply.
#[async_trait]
pub trait MessageReceiverWithAckResponse: Send + Sync + 'static {
    async fn receive_message(&self, message: PubsubMessage, consumer: AckReplyConsumerWithResponse);
}

#[async_trait]
impl<F, Fut> MessageReceiver for F
where
    F: Fn(PubsubMessage, AckReplyConsumer) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn receive_message(&self, message: PubsubMessage, consumer: AckReplyConsumer) {
        (self)(message, consumer).await
    }
}

#[async_trait]
impl<F, Fut> MessageReceiverWithAckResponse for F
where
    F: Fn(PubsubMessage, AckReplyConsumerWithResponse) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn receive_message(&self, message: PubsubMessage, consumer: AckReplyConsumerWithResponse) {
        (self)(message, consumer).await
    }
}

/// The user callback, in one of its two shapes.
#[derive(Clone)]
pub enum Receiver {
    Plain(Arc<dyn MessageReceiver>),
    WithAckResponse(Arc<dyn MessageReceiverWithAckResponse>),
}

impl Receiver {
    pub fn plain(receiver: impl MessageReceiver) -> Self {
        Receiver::Plain(Arc::new(receiver))
    }

    pub fn with_ack_response(receiver: impl MessageReceiverWithAckResponse) -> Self {
        Receiver::WithAckResponse(Arc::new(receiver))
    }

    pub(crate) fn wants_response(&self) -> bool {
        matches!(self, Receiver::WithAckResponse(_))
    }
}

/// Ack or nack exactly once. Dropping the consumer without replying nacks.
pub struct AckReplyConsumer {
    handler: Option<AckHandler>,
}

impl AckReplyConsumer {
    pub(crate) fn new(handler: AckHandler) -> Self {
        Self {
            handler: Some(handler),
        }
    }

    pub fn ack(mut self) {
        if let Some(handler) = self.handler.take() {
            handler.reply(AckReply::Ack);
        }
    }

    pub fn nack(mut self) {
        if let Some(handler) = self.handler.take() {
            handler.reply(AckReply::Nack);
        }
    }
}

impl Drop for AckReplyConsumer {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            tracing::warn!(ack_id = %handler.ack_id(), "consumer dropped without reply; nacking");
            handler.reply(AckReply::Nack);
        }
    }
}

/// Like [`AckReplyConsumer`], but `ack`/`nack` return the broker's confirmation.
///
/// Outside exactly-once delivery the response is `Successful` once the reply has been sent.
pub struct AckReplyConsumerWithResponse {
    handler: Option<AckHandler>,
    response_rx: Option<oneshot::Receiver<AckResponse>>,
}

impl AckReplyConsumerWithResponse {
    pub(crate) fn new(handler: AckHandler, response_rx: oneshot::Receiver<AckResponse>) -> Self {
        Self {
            handler: Some(handler),
            response_rx: Some(response_rx),
        }
    }

    pub fn ack(mut self) -> impl Future<Output = AckResponse> + Send + 'static {
        self.reply(AckReply::Ack)
    }

    pub fn nack(mut self) -> impl Future<Output = AckResponse> + Send + 'static {
        self.reply(AckReply::Nack)
    }

    fn reply(
        &mut self,
        reply: AckReply,
    ) -> impl Future<Output = AckResponse> + Send + 'static + use<> {
        let response_rx = self.response_rx.take();
        if let Some(handler) = self.handler.take() {
            handler.reply(reply);
        }
        async move {
            match response_rx {
                Some(rx) => rx.await.unwrap_or(AckResponse::Other),
                None => AckResponse::Other,
            }
        }
    }
}

impl Drop for AckReplyConsumerWithResponse {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            tracing::warn!(ack_id = %handler.ack_id(), "consumer dropped without reply; nacking");
            handler.reply(AckReply::Nack);
        }
    }
}
