use anyhow::{Context, Result, bail};
use consumer_core::config::load_config;
use consumer_core::telemetry::init_tracing;
use consumer_core::{
    Batch, ConsumeContext, ConsumerGroup, ConsumerOptions, ConsumerWatcher, HandlerError,
    handler_fn,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Entry point for running a long-lived consumer on container hosting
/// services like AWS EKS, ECS, etc.
///
/// Environment:
///     CONSUMER_CONFIG          broker settings as YAML
///     CONSUMER_GROUP           consumer group id
///     CONSUMER_TOPICS          comma separated topic list, or
///     CONSUMER_TOPIC_PATTERNS  comma separated regular expressions
///     CONSUMER_BATCH_MAX       optional; enables batch mode
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = load_config(std::env::var("CONSUMER_CONFIG_PATH").ok().as_deref())
        .await
        .context("Failed to load consumer configuration")?;
    let group_id = std::env::var("CONSUMER_GROUP").context("CONSUMER_GROUP is not set")?;
    let options = match std::env::var("CONSUMER_BATCH_MAX") {
        Ok(max) => ConsumerOptions::new().batch(max.parse().context("Invalid CONSUMER_BATCH_MAX")?),
        Err(_) => ConsumerOptions::new(),
    };

    let handler = handler_fn(|ctx: ConsumeContext, batch: Batch| async move {
        info!(
            trace_id = ctx.trace_id().unwrap_or_default(),
            topic = %batch.topic(),
            partition = batch.partition(),
            first_offset = batch.first_offset(),
            last_offset = batch.last_offset(),
            size = batch.len(),
            "received batch"
        );
        Ok::<(), HandlerError>(())
    });

    let shutdown = CancellationToken::new();
    let topics = list_var("CONSUMER_TOPICS");
    let patterns = list_var("CONSUMER_TOPIC_PATTERNS");

    match (topics, patterns) {
        (Some(topics), None) => {
            let group = ConsumerGroup::new(&shutdown, &group_id, &config, handler, options)?;
            info!(group = %group_id, ?topics, "starting consumer");
            let result = run_until_signal(group.consume(&topics), &shutdown).await;
            group.close().await?;
            report(result)
        }
        (None, Some(patterns)) => {
            let consumer =
                ConsumerWatcher::new(&shutdown, &group_id, &config, handler, &patterns, options)?;
            info!(group = %group_id, ?patterns, "starting pattern consumer");
            let result = run_until_signal(consumer.consume(), &shutdown).await;
            consumer.close().await?;
            report(result)
        }
        (Some(_), Some(_)) => bail!("Set only one of CONSUMER_TOPICS and CONSUMER_TOPIC_PATTERNS"),
        (None, None) => bail!("Set CONSUMER_TOPICS or CONSUMER_TOPIC_PATTERNS"),
    }
}

fn list_var(name: &str) -> Option<Vec<String>> {
    let value = std::env::var(name).ok()?;
    let items: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect();
    (!items.is_empty()).then_some(items)
}

/// Drives `consume` until it returns or ctrl-c is received. On ctrl-c the
/// shared token is cancelled and the consume loop is left to wind down.
async fn run_until_signal<C>(consume: C, shutdown: &CancellationToken) -> consumer_core::Result<()>
where
    C: std::future::Future<Output = consumer_core::Result<()>>,
{
    tokio::pin!(consume);
    tokio::select! {
        result = &mut consume => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, closing consumer");
            shutdown.cancel();
            consume.await
        }
    }
}

fn report(result: consumer_core::Result<()>) -> Result<()> {
    if let Err(e) = &result {
        error!(error = %e, "consumer stopped with an error");
    }
    result.context("Consumer failed")
}
