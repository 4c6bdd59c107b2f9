//! Prometheus health metrics for the pipeline.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "loginflow" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Total payloads consumed from the input topic.
    pub events_consumed: Counter,
    /// Total enriched records handed to the publisher.
    pub events_enriched: Counter,
    /// Total records acknowledged by the output broker.
    pub events_published: Counter,
    /// Payloads dropped without output, by reason.
    pub events_dropped: CounterVec,
    /// Offset commit failures.
    pub commit_failures: Counter,
    /// Delivery attempts that had to be retried.
    pub publish_retries: Counter,
    /// Batches abandoned after the retry budget was exhausted.
    pub publish_batch_failures: Counter,
    /// Per-event processing duration from poll to publisher hand-off.
    pub event_processing_duration: Histogram,
    /// Publisher flush duration.
    pub publish_flush_duration: Histogram,
    /// Records per flushed batch.
    pub publish_batch_records: Histogram,
    /// Distinct users tracked in aggregation state.
    pub users_tracked: Gauge,
    /// Distinct devices tracked in aggregation state.
    pub devices_tracked: Gauge,
    /// Distinct app versions tracked in aggregation state.
    pub versions_tracked: Gauge,
    /// Distinct locales tracked in aggregation state.
    pub locales_tracked: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_consumed = Counter::with_opts(
            Opts::new(
                "events_consumed_total",
                "Total payloads consumed from the input topic.",
            )
            .namespace("loginflow"),
        )?;
        let events_enriched = Counter::with_opts(
            Opts::new(
                "events_enriched_total",
                "Total enriched records handed to the publisher.",
            )
            .namespace("loginflow"),
        )?;
        let events_published = Counter::with_opts(
            Opts::new(
                "events_published_total",
                "Total records acknowledged by the output broker.",
            )
            .namespace("loginflow"),
        )?;
        let events_dropped = CounterVec::new(
            Opts::new(
                "events_dropped_total",
                "Payloads dropped without output, by reason.",
            )
            .namespace("loginflow"),
            &["reason"],
        )?;
        let commit_failures = Counter::with_opts(
            Opts::new("commit_failures_total", "Offset commit failures.").namespace("loginflow"),
        )?;
        let publish_retries = Counter::with_opts(
            Opts::new(
                "publish_retries_total",
                "Delivery attempts that had to be retried.",
            )
            .namespace("loginflow"),
        )?;
        let publish_batch_failures = Counter::with_opts(
            Opts::new(
                "publish_batch_failures_total",
                "Batches abandoned after the retry budget was exhausted.",
            )
            .namespace("loginflow"),
        )?;
        let event_processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "event_processing_duration_seconds",
                "Per-event processing duration from poll to publisher hand-off.",
            )
            .namespace("loginflow")
            .buckets(vec![
                0.00001, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
            ]),
        )?;
        let publish_flush_duration = Histogram::with_opts(
            HistogramOpts::new("publish_flush_duration_seconds", "Publisher flush duration.")
                .namespace("loginflow")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        let publish_batch_records = Histogram::with_opts(
            HistogramOpts::new("publish_batch_records", "Records per flushed batch.")
                .namespace("loginflow")
                .buckets(vec![1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0]),
        )?;
        let users_tracked = Gauge::with_opts(
            Opts::new(
                "users_tracked",
                "Distinct users tracked in aggregation state.",
            )
            .namespace("loginflow"),
        )?;
        let devices_tracked = Gauge::with_opts(
            Opts::new(
                "devices_tracked",
                "Distinct devices tracked in aggregation state.",
            )
            .namespace("loginflow"),
        )?;
        let versions_tracked = Gauge::with_opts(
            Opts::new(
                "versions_tracked",
                "Distinct app versions tracked in aggregation state.",
            )
            .namespace("loginflow"),
        )?;
        let locales_tracked = Gauge::with_opts(
            Opts::new(
                "locales_tracked",
                "Distinct locales tracked in aggregation state.",
            )
            .namespace("loginflow"),
        )?;

        registry.register(Box::new(events_consumed.clone()))?;
        registry.register(Box::new(events_enriched.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(commit_failures.clone()))?;
        registry.register(Box::new(publish_retries.clone()))?;
        registry.register(Box::new(publish_batch_failures.clone()))?;
        registry.register(Box::new(event_processing_duration.clone()))?;
        registry.register(Box::new(publish_flush_duration.clone()))?;
        registry.register(Box::new(publish_batch_records.clone()))?;
        registry.register(Box::new(users_tracked.clone()))?;
        registry.register(Box::new(devices_tracked.clone()))?;
        registry.register(Box::new(versions_tracked.clone()))?;
        registry.register(Box::new(locales_tracked.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_consumed,
            events_enriched,
            events_published,
            events_dropped,
            commit_failures,
            publish_retries,
            publish_batch_failures,
            event_processing_duration,
            publish_flush_duration,
            publish_batch_records,
            users_tracked,
            devices_tracked,
            versions_tracked,
            locales_tracked,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
