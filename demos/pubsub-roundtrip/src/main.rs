//! Pub/sub roundtrip demo.
//!
//! # Purpose
//! Demonstrates the end-to-end flow through the client runtime: batched publish, streaming
//! pull, user callback, ack and orderly shutdown, all against an in-process broker.
//!
//! # Notes
//! This is a developer-facing demo; it favors clarity over performance.
use anyhow::{Context, Result, bail};
use clap::Parser;
use kestrel_client::{
    AckReplyConsumer, Publisher, PublisherConfig, Receiver, Subscriber, SubscriberConfig,
};
use kestrel_test_harness::InMemoryBroker;
use kestrel_wire::PubsubMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;

const TOPIC: &str = "demo-topic";
const SUBSCRIPTION: &str = "demo-sub";

#[derive(Parser, Debug)]
#[command(name = "pubsub-roundtrip")]
#[command(about = "Publish and consume messages through an in-process kestrel broker")]
struct Args {
    /// Number of messages to send
    #[arg(long, default_value = "3")]
    messages: usize,

    /// Enable exactly-once delivery on the demo subscription
    #[arg(long, default_value = "false")]
    exactly_once: bool,
}

/// Summary of one demo run.
#[derive(Debug)]
struct RoundtripReport {
    received: Vec<String>,
    acked: usize,
}

async fn run_demo(messages: usize, exactly_once: bool) -> Result<RoundtripReport> {
    println!("== Kestrel Pub/Sub Roundtrip Demo ==");
    println!("Step 1/5: booting in-process broker.");
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_subscription(TOPIC, SUBSCRIPTION, exactly_once);

    println!("Step 2/5: starting subscriber.");
    let (tx, mut rx) = mpsc::unbounded_channel();
    let receiver = Receiver::plain(move |message: PubsubMessage, consumer: AckReplyConsumer| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(String::from_utf8_lossy(&message.data).into_owned());
            consumer.ack();
        }
    });
    let subscriber = Subscriber::new(
        SubscriberConfig::from_env_or_yaml(SUBSCRIPTION, None)?,
        broker.clone(),
        receiver,
    )
    .context("build subscriber")?;
    subscriber.start().context("start subscriber")?;

    println!("Step 3/5: publishing {messages} messages.");
    let publisher = Publisher::new(PublisherConfig::from_env_or_yaml(TOPIC, None)?, broker.clone())
        .context("build publisher")?;
    let mut handles = Vec::with_capacity(messages);
    for index in 0..messages {
        let message = PubsubMessage::new(format!("message-{index}"));
        handles.push(publisher.publish(message).await?);
    }
    for handle in handles {
        let id = handle.await.context("publish")?;
        println!("Published message id {id}");
    }

    println!("Step 4/5: receiving messages.");
    let mut received = Vec::with_capacity(messages);
    while received.len() < messages {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(payload)) => {
                println!("Received {payload}");
                received.push(payload);
            }
            Ok(None) => bail!("receiver channel closed early"),
            Err(_) => bail!("timed out waiting for messages"),
        }
    }

    println!("Step 5/5: shutting down.");
    publisher.shutdown().await.context("publisher shutdown")?;
    subscriber.stop().await;
    let acked = broker.acked_message_ids(SUBSCRIPTION).len();
    println!("Acked {acked} messages. Demo complete.");
    Ok(RoundtripReport { received, acked })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();
    let report = run_demo(args.messages, args.exactly_once).await?;
    tracing::info!(
        received = report.received.len(),
        acked = report.acked,
        "roundtrip finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roundtrip_demo_end_to_end() -> Result<()> {
        let mut report = tokio::time::timeout(Duration::from_secs(10), run_demo(3, false))
            .await
            .context("roundtrip demo timeout")??;
        report.received.sort();
        assert_eq!(
            report.received,
            vec!["message-0", "message-1", "message-2"]
        );
        assert_eq!(report.acked, 3);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn roundtrip_demo_exactly_once() -> Result<()> {
        let report = tokio::time::timeout(Duration::from_secs(10), run_demo(2, true))
            .await
            .context("roundtrip demo timeout")??;
        assert_eq!(report.received.len(), 2);
        assert_eq!(report.acked, 2);
        Ok(())
    }
}
