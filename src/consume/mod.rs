//! Kafka consumption: worker loops, offset management, topic admin.
//!
//! Each worker owns its own `StreamConsumer` joined to the shared
//! consumer group, so the broker divides partitions across workers and
//! per-partition order is preserved within a worker. Offsets are
//! committed only after the enriched record is with the publisher,
//! keeping delivery at-least-once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::types::RDKafkaErrorCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{KafkaConfig, RetryConfig};
use crate::enrich::{process_payload, Rejection};
use crate::export::HealthMetrics;
use crate::publish::{OutboundRecord, PublisherHandle};
use crate::state::AggregationState;
use crate::stats::PipelineStats;

/// Longest payload excerpt included in drop logs.
const PAYLOAD_EXCERPT_CHARS: usize = 128;

/// Everything a consumer worker shares with the rest of the pipeline.
#[derive(Clone)]
pub struct WorkerContext {
    pub state: Arc<AggregationState>,
    pub stats: Arc<PipelineStats>,
    pub health: Arc<HealthMetrics>,
    pub publisher: PublisherHandle,
    /// Poll failure retry policy; exhaustion is fatal for the process.
    pub retry: RetryConfig,
}

/// Build a group consumer subscribed to the input topic.
pub fn build_consumer(kafka: &KafkaConfig) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &kafka.bootstrap_servers)
        .set("group.id", &kafka.group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", &kafka.offset_reset)
        .create()
        .context("creating Kafka consumer")?;

    consumer
        .subscribe(&[kafka.input_topic.as_str()])
        .with_context(|| format!("subscribing to {}", kafka.input_topic))?;

    Ok(consumer)
}

/// Verify broker reachability before starting workers, retrying with
/// backoff. Exhaustion means the process should exit non-zero.
pub async fn wait_for_broker(consumer: &StreamConsumer, kafka: &KafkaConfig) -> Result<()> {
    let retry = kafka.retry;

    for attempt in 1..=retry.max_attempts {
        match consumer.fetch_metadata(Some(kafka.input_topic.as_str()), Duration::from_secs(5)) {
            Ok(_) => {
                info!(
                    brokers = %kafka.bootstrap_servers,
                    topic = %kafka.input_topic,
                    "broker reachable",
                );
                return Ok(());
            }
            Err(e) => {
                if attempt == retry.max_attempts {
                    return Err(e).with_context(|| {
                        format!(
                            "broker unreachable after {} attempts: {}",
                            retry.max_attempts, kafka.bootstrap_servers,
                        )
                    });
                }

                let delay = retry.backoff(attempt);
                warn!(
                    attempt,
                    error = %e,
                    delay = ?delay,
                    "broker unreachable, backing off",
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    bail!("broker unreachable: {}", kafka.bootstrap_servers)
}

/// Drive one worker until shutdown or an unrecoverable broker failure.
pub async fn run_worker(
    worker: usize,
    consumer: StreamConsumer,
    ctx: WorkerContext,
    cancel: CancellationToken,
) -> Result<()> {
    let mut stream = consumer.stream();
    let mut poll_failures = 0u32;

    info!(worker, "consumer worker started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(worker, "consumer worker stopping");
                return Ok(());
            }

            message = stream.next() => {
                match message {
                    Some(Ok(msg)) => {
                        poll_failures = 0;
                        handle_message(worker, &consumer, &msg, &ctx).await?;
                    }
                    Some(Err(e)) => {
                        poll_failures += 1;

                        if poll_failures >= ctx.retry.max_attempts {
                            error!(
                                worker,
                                error = %e,
                                attempts = poll_failures,
                                "broker poll retry budget exhausted",
                            );
                            return Err(e).context("broker unavailable");
                        }

                        let delay = ctx.retry.backoff(poll_failures);
                        warn!(
                            worker,
                            error = %e,
                            attempt = poll_failures,
                            delay = ?delay,
                            "broker poll failed, backing off",
                        );

                        tokio::select! {
                            _ = cancel.cancelled() => return Ok(()),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    None => {
                        warn!(worker, "consumer stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Run one payload through the pipeline and commit its offset.
///
/// Per-event failures are isolated here: the payload is counted,
/// logged with enough context to replay it manually, and committed so
/// poison input is not consumed again on restart.
async fn handle_message(
    worker: usize,
    consumer: &StreamConsumer,
    msg: &BorrowedMessage<'_>,
    ctx: &WorkerContext,
) -> Result<()> {
    let started = Instant::now();
    ctx.health.events_consumed.inc();

    let payload = msg.payload().unwrap_or_default();

    match process_payload(payload, &ctx.state) {
        Ok(processed) => {
            let record = OutboundRecord::from_processed(&processed)?;

            if ctx.publisher.send(record).await.is_err() {
                // The publisher only closes during shutdown; leave the
                // offset uncommitted so the event is reprocessed.
                warn!(
                    worker,
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "publisher closed, leaving offset uncommitted",
                );
                return Ok(());
            }

            ctx.health.events_enriched.inc();
            commit(consumer, msg, ctx);

            let latency = started.elapsed();
            ctx.health
                .event_processing_duration
                .observe(latency.as_secs_f64());

            if ctx.stats.record_enriched(latency) {
                report_sample(ctx);
            }
        }
        Err(rejection) => {
            ctx.stats.record_dropped();
            ctx.health
                .events_dropped
                .with_label_values(&[rejection.reason()])
                .inc();

            match &rejection {
                Rejection::FilteredOut { .. } => {
                    debug!(
                        worker,
                        partition = msg.partition(),
                        offset = msg.offset(),
                        reason = rejection.reason(),
                        "payload filtered",
                    );
                }
                Rejection::Malformed(_) | Rejection::InvalidTimestamp(_) => {
                    warn!(
                        worker,
                        partition = msg.partition(),
                        offset = msg.offset(),
                        reason = rejection.reason(),
                        error = %rejection,
                        payload = %payload_excerpt(payload),
                        "payload dropped",
                    );
                }
            }

            commit(consumer, msg, ctx);
        }
    }

    Ok(())
}

fn commit(consumer: &StreamConsumer, msg: &BorrowedMessage<'_>, ctx: &WorkerContext) {
    if let Err(e) = consumer.commit_message(msg, CommitMode::Async) {
        ctx.health.commit_failures.inc();
        warn!(
            error = %e,
            partition = msg.partition(),
            offset = msg.offset(),
            "offset commit failed",
        );
    }
}

/// Emit the periodic benchmark report and refresh cardinality gauges.
fn report_sample(ctx: &WorkerContext) {
    let sample = ctx.stats.sample();

    ctx.health.users_tracked.set(ctx.state.tracked_users() as f64);
    ctx.health
        .devices_tracked
        .set(ctx.state.tracked_devices() as f64);
    ctx.health
        .versions_tracked
        .set(ctx.state.tracked_versions() as f64);
    ctx.health
        .locales_tracked
        .set(ctx.state.tracked_locales() as f64);

    match sample.resources {
        Some(res) => info!(
            throughput_per_sec = sample.throughput_per_sec,
            avg_latency = ?sample.avg_latency,
            processed = sample.processed_total,
            dropped = sample.dropped_total,
            rss_mb = res.rss_bytes as f64 / (1024.0 * 1024.0),
            cpu_pct = res.cpu_percent,
            "pipeline sample",
        ),
        None => info!(
            throughput_per_sec = sample.throughput_per_sec,
            avg_latency = ?sample.avg_latency,
            processed = sample.processed_total,
            dropped = sample.dropped_total,
            "pipeline sample",
        ),
    }
}

/// Truncated, lossy payload excerpt for drop logs.
fn payload_excerpt(payload: &[u8]) -> String {
    let text = String::from_utf8_lossy(payload);
    if text.chars().count() <= PAYLOAD_EXCERPT_CHARS {
        text.into_owned()
    } else {
        let mut excerpt: String = text.chars().take(PAYLOAD_EXCERPT_CHARS).collect();
        excerpt.push('…');
        excerpt
    }
}

/// Create a topic via the admin API. Already-existing topics are fine.
pub async fn create_topic(
    kafka: &KafkaConfig,
    topic: &str,
    partitions: i32,
    replication: i32,
) -> Result<()> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", &kafka.bootstrap_servers)
        .create()
        .context("creating Kafka admin client")?;

    let new_topic = NewTopic::new(topic, partitions, TopicReplication::Fixed(replication));

    let results = admin
        .create_topics([&new_topic], &AdminOptions::new())
        .await
        .context("requesting topic creation")?;

    for result in results {
        match result {
            Ok(name) => info!(topic = %name, partitions, replication, "topic created"),
            Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                info!(topic = %name, "topic already exists");
            }
            Err((name, code)) => bail!("creating topic {name}: {code}"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_excerpt_passthrough_when_short() {
        assert_eq!(payload_excerpt(b"short payload"), "short payload");
    }

    #[test]
    fn test_payload_excerpt_truncates_long_input() {
        let long = "x".repeat(500);
        let excerpt = payload_excerpt(long.as_bytes());
        assert_eq!(excerpt.chars().count(), PAYLOAD_EXCERPT_CHARS + 1);
        assert!(excerpt.ends_with('…'));
    }

    #[test]
    fn test_payload_excerpt_handles_invalid_utf8() {
        let excerpt = payload_excerpt(&[0xff, 0xfe, b'a']);
        assert!(excerpt.contains('a'));
    }
}
