// Load generator: publishes through the batching publisher into an in-memory broker.
use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use kestrel_client::{LogTracer, Publisher, PublisherConfig};
use kestrel_test_harness::InMemoryBroker;
use kestrel_wire::PubsubMessage;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "publisher")]
#[command(about = "Publish load through the kestrel publisher into an in-memory broker")]
struct Args {
    /// Topic name
    #[arg(long, default_value = "load-topic")]
    topic: String,

    /// Message payload size in bytes
    #[arg(long, default_value = "1024")]
    payload_size: usize,

    /// Messages per second rate (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate: u64,

    /// Total number of messages to publish
    #[arg(long, default_value = "10000")]
    count: u64,

    /// Number of distinct ordering keys (0 = unordered)
    #[arg(long, default_value = "0")]
    ordering_keys: u64,

    /// Optional publisher config YAML (falls back to KESTREL_PUBLISHER_CONFIG)
    #[arg(long)]
    config: Option<String>,

    /// Publisher ID for logging
    #[arg(long, default_value = "pub-1")]
    id: String,
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
    info!(
        id = %args.id,
        topic = %args.topic,
        payload_size = args.payload_size,
        rate = args.rate,
        count = args.count,
        ordering_keys = args.ordering_keys,
        "Starting publisher"
    );

    let mut config = PublisherConfig::from_env_or_yaml(args.topic.clone(), args.config.as_deref())
        .context("load publisher config")?;
    if args.ordering_keys > 0 {
        config.enable_message_ordering = true;
    }

    let broker = Arc::new(InMemoryBroker::new());
    broker.create_subscription(&args.topic, "load-sub", false);
    let publisher = Publisher::builder(config, broker.clone())
        .tracer(Arc::new(LogTracer))
        .build()
        .context("build publisher")?;

    let payload = vec![b'x'; args.payload_size];
    let delay = if args.rate > 0 {
        Some(Duration::from_micros(1_000_000 / args.rate))
    } else {
        None
    };

    let start_time = Instant::now();
    let mut handles = Vec::with_capacity(args.count as usize);
    let mut rejected = 0u64;
    for index in 0..args.count {
        let mut message = PubsubMessage::new(payload.clone());
        if args.ordering_keys > 0 {
            message = message.with_ordering_key(format!("key-{}", index % args.ordering_keys));
        }
        match publisher.publish(message).await {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                rejected += 1;
                if rejected % 100 == 1 {
                    error!(id = %args.id, error = %e, rejected, "Publish rejected");
                }
            }
        }
        if let Some(delay) = delay {
            sleep(delay).await;
        }
    }

    let results = join_all(handles).await;
    let published = results.iter().filter(|r| r.is_ok()).count() as u64;
    let errors = results.len() as u64 - published;
    publisher.shutdown().await.context("shutdown publisher")?;

    let elapsed = start_time.elapsed();
    let rate = published as f64 / elapsed.as_secs_f64();
    info!(
        id = %args.id,
        published,
        errors,
        rejected,
        backlog = broker.backlog("load-sub"),
        elapsed = format!("{:.2}s", elapsed.as_secs_f64()),
        rate = format!("{:.2} msg/s", rate),
        "Publisher completed"
    );

    Ok(())
}
