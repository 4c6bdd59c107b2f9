//! Batching publisher for enriched records.
//!
//! Records are accepted into a bounded queue and buffered by a
//! background task that flushes when either the configured byte
//! threshold is reached or the linger delay elapses, whichever first.
//! Batching amortizes transport overhead only; enqueue order is
//! preserved within a flush. Delivery is at-least-once: failed records
//! are retried with bounded exponential backoff, and retry exhaustion
//! is surfaced as a batch failure rather than silently dropped.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{KafkaConfig, PublisherConfig};
use crate::event::ProcessedEvent;
use crate::export::HealthMetrics;

/// A serialized record bound for the output topic.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Partitioning key; the event's user id, so per-user order holds
    /// downstream.
    pub key: String,
    /// JSON-serialized [`ProcessedEvent`].
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    /// Serialize an enriched event for publication.
    pub fn from_processed(event: &ProcessedEvent) -> Result<Self> {
        let payload = serde_json::to_vec(event).context("serializing enriched record")?;
        Ok(Self {
            key: event.user_id.clone(),
            payload,
        })
    }
}

/// Cloneable hand-off endpoint used by consumer workers.
#[derive(Clone)]
pub struct PublisherHandle {
    tx: mpsc::Sender<OutboundRecord>,
}

impl PublisherHandle {
    /// Hand one record to the publisher, blocking on backpressure.
    /// Fails only once the publisher has shut down.
    pub async fn send(&self, record: OutboundRecord) -> Result<()> {
        self.tx
            .send(record)
            .await
            .map_err(|_| anyhow!("publisher queue closed"))
    }
}

/// Owns the Kafka producer and the background batching task.
pub struct Publisher {
    handle: PublisherHandle,
    task: tokio::task::JoinHandle<()>,
}

impl Publisher {
    /// Build the producer and spawn the batching task.
    pub fn start(
        kafka: &KafkaConfig,
        cfg: &PublisherConfig,
        health: Arc<HealthMetrics>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &kafka.bootstrap_servers)
            .set("acks", "all")
            .set("compression.type", &cfg.compression)
            .set("message.timeout.ms", cfg.ack_timeout.as_millis().to_string())
            .create()
            .context("creating Kafka producer")?;

        let (tx, rx) = mpsc::channel(cfg.queue_size);

        let task = tokio::spawn(run_accumulator(
            producer,
            cfg.clone(),
            kafka.output_topic.clone(),
            rx,
            health,
            cancel,
        ));

        info!(
            batch_max_bytes = cfg.batch_max_bytes,
            linger = ?cfg.linger,
            compression = %cfg.compression,
            "publisher started",
        );

        Ok(Self {
            handle: PublisherHandle { tx },
            task,
        })
    }

    /// Returns a hand-off endpoint for workers.
    pub fn handle(&self) -> PublisherHandle {
        self.handle.clone()
    }

    /// Waits for the batching task to drain and exit. Call after
    /// cancelling the token passed to [`Publisher::start`].
    pub async fn wait_for_shutdown(self) {
        drop(self.handle);
        if let Err(e) = self.task.await {
            error!(error = %e, "publisher task join failed");
        }
    }
}

/// Buffers records and flushes on byte threshold or linger expiry.
async fn run_accumulator(
    producer: FutureProducer,
    cfg: PublisherConfig,
    topic: String,
    mut rx: mpsc::Receiver<OutboundRecord>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut batch: Vec<OutboundRecord> = Vec::new();
    let mut buffered_bytes = 0usize;

    let mut linger = tokio::time::interval(cfg.linger);
    linger.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Pull whatever workers already queued, then flush
                // best-effort before exiting.
                while let Ok(record) = rx.try_recv() {
                    buffered_bytes += record.payload.len();
                    batch.push(record);
                }

                flush(&producer, &cfg, &topic, std::mem::take(&mut batch), &health).await;
                return;
            }

            record = rx.recv() => {
                match record {
                    Some(record) => {
                        buffered_bytes += record.payload.len();
                        batch.push(record);

                        if buffered_bytes >= cfg.batch_max_bytes {
                            buffered_bytes = 0;
                            flush(&producer, &cfg, &topic, std::mem::take(&mut batch), &health)
                                .await;
                        }
                    }
                    None => {
                        flush(&producer, &cfg, &topic, std::mem::take(&mut batch), &health).await;
                        return;
                    }
                }
            }

            _ = linger.tick() => {
                if !batch.is_empty() {
                    buffered_bytes = 0;
                    flush(&producer, &cfg, &topic, std::mem::take(&mut batch), &health).await;
                }
            }
        }
    }
}

/// Delivers one batch, retrying failures; exhaustion is reported and
/// counted, never silent.
async fn flush(
    producer: &FutureProducer,
    cfg: &PublisherConfig,
    topic: &str,
    batch: Vec<OutboundRecord>,
    health: &HealthMetrics,
) {
    if batch.is_empty() {
        return;
    }

    let records = batch.len();
    let started = std::time::Instant::now();

    match deliver_with_retry(producer, cfg, topic, batch, health).await {
        Ok(()) => {
            debug!(records, "flushed batch");
        }
        Err(e) => {
            health.publish_batch_failures.inc();
            error!(error = %e, records, "batch delivery failed after retry budget");
        }
    }

    health
        .publish_flush_duration
        .observe(started.elapsed().as_secs_f64());
    health.publish_batch_records.observe(records as f64);
}

async fn deliver_with_retry(
    producer: &FutureProducer,
    cfg: &PublisherConfig,
    topic: &str,
    batch: Vec<OutboundRecord>,
    health: &HealthMetrics,
) -> Result<()> {
    let mut pending = batch;

    for attempt in 1..=cfg.retry.max_attempts {
        pending = send_once(producer, topic, pending, health).await;

        if pending.is_empty() {
            return Ok(());
        }

        if attempt < cfg.retry.max_attempts {
            let delay = cfg.retry.backoff(attempt);
            health.publish_retries.inc();
            warn!(
                attempt,
                undelivered = pending.len(),
                delay = ?delay,
                "delivery failed, backing off",
            );
            tokio::time::sleep(delay).await;
        }
    }

    bail!(
        "{} records undelivered after {} attempts",
        pending.len(),
        cfg.retry.max_attempts,
    )
}

/// Enqueue every record, then await the deliveries in enqueue order.
/// Returns the records that were not acknowledged.
async fn send_once(
    producer: &FutureProducer,
    topic: &str,
    records: Vec<OutboundRecord>,
    health: &HealthMetrics,
) -> Vec<OutboundRecord> {
    let mut inflight: Vec<(OutboundRecord, Result<DeliveryFuture, KafkaError>)> =
        Vec::with_capacity(records.len());

    for record in records {
        let queued = {
            let future_record = FutureRecord::to(topic)
                .key(&record.key)
                .payload(&record.payload);
            producer.send_result(future_record).map_err(|(e, _)| e)
        };
        inflight.push((record, queued));
    }

    let mut failed = Vec::new();

    for (record, queued) in inflight {
        match queued {
            Ok(delivery) => match delivery.await {
                Ok(Ok(_)) => health.events_published.inc(),
                Ok(Err((e, _))) => {
                    warn!(error = %e, key = %record.key, "record delivery failed");
                    failed.push(record);
                }
                Err(_) => {
                    warn!(key = %record.key, "delivery future canceled");
                    failed.push(record);
                }
            },
            Err(e) => {
                debug!(error = %e, key = %record.key, "producer enqueue failed");
                failed.push(record);
            }
        }
    }

    failed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_record_from_processed() {
        let event = ProcessedEvent {
            user_id: "u1".to_string(),
            app_version: "2.3.0".to_string(),
            total_logins_for_version: 2,
            ip: "5.6.7.8".to_string(),
            suspicious_login: true,
            logs_from_multiple_locations: false,
            normalized_timestamp: "2024-03-24 17:50:36".to_string(),
            locale: "NC".to_string(),
            total_logins_from_locale: 2,
            device_id: "d1".to_string(),
            shared_device: false,
            device_type: "android".to_string(),
            most_common_device_type: "android".to_string(),
        };

        let record = OutboundRecord::from_processed(&event).expect("serialize");
        assert_eq!(record.key, "u1");

        let parsed: ProcessedEvent =
            serde_json::from_slice(&record.payload).expect("valid JSON payload");
        assert_eq!(parsed.total_logins_for_version, 2);
        assert!(parsed.suspicious_login);
    }
}
