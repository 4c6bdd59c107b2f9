//! Pipeline orchestration: owns component lifecycle and shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consume::{self, WorkerContext};
use crate::export::HealthMetrics;
use crate::publish::Publisher;
use crate::state::AggregationState;
use crate::stats::PipelineStats;

/// Agent orchestrates all components: health server, aggregation
/// state, publisher, and consumer workers.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    state: Arc<AggregationState>,
    stats: Arc<PipelineStats>,
    publisher: Option<Publisher>,
    workers: JoinSet<Result<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let stats = Arc::new(PipelineStats::new(cfg.stats.sample_interval));

        Ok(Self {
            cfg,
            health,
            state: Arc::new(AggregationState::new()),
            stats,
            publisher: None,
            workers: JoinSet::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin consuming.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Build the first consumer and verify broker reachability
        // before spawning anything else; an unreachable broker after
        // the retry budget is an unrecoverable startup failure.
        let first_consumer = consume::build_consumer(&self.cfg.kafka)?;
        consume::wait_for_broker(&first_consumer, &self.cfg.kafka).await?;

        // 3. Publisher, so workers have somewhere to hand records.
        let publisher = Publisher::start(
            &self.cfg.kafka,
            &self.cfg.publisher,
            Arc::clone(&self.health),
            self.cancel.child_token(),
        )?;

        let ctx = WorkerContext {
            state: Arc::clone(&self.state),
            stats: Arc::clone(&self.stats),
            health: Arc::clone(&self.health),
            publisher: publisher.handle(),
            retry: self.cfg.kafka.retry,
        };

        // 4. Consumer workers. Each joins the group independently, so
        // the broker assigns each a disjoint partition subset.
        let mut consumers = vec![first_consumer];
        for _ in 1..self.cfg.workers {
            consumers.push(consume::build_consumer(&self.cfg.kafka)?);
        }

        for (worker, consumer) in consumers.into_iter().enumerate() {
            let ctx = ctx.clone();
            let cancel = self.cancel.child_token();
            self.workers
                .spawn(consume::run_worker(worker, consumer, ctx, cancel));
        }

        self.publisher = Some(publisher);

        info!(
            workers = self.cfg.workers,
            input_topic = %self.cfg.kafka.input_topic,
            output_topic = %self.cfg.kafka.output_topic,
            group = %self.cfg.kafka.group_id,
            "pipeline started",
        );

        Ok(())
    }

    /// Runs until shutdown is requested or a worker fails
    /// unrecoverably. A worker error cancels the rest of the pipeline
    /// and propagates to the caller.
    pub async fn wait(&mut self) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),

                joined = self.workers.join_next() => {
                    match joined {
                        Some(Ok(Ok(()))) => continue,
                        Some(Ok(Err(e))) => {
                            self.cancel.cancel();
                            return Err(e);
                        }
                        Some(Err(e)) => {
                            self.cancel.cancel();
                            return Err(e).context("consumer worker panicked");
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Gracefully stop all components: cancel workers, drain the
    /// publisher best-effort, stop the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "worker exited with error"),
                Err(e) => error!(error = %e, "worker join failed"),
            }
        }

        if let Some(publisher) = self.publisher.take() {
            publisher.wait_for_shutdown().await;
        }

        self.health.stop().await?;

        info!(
            processed = self.stats.processed_total(),
            users = self.state.tracked_users(),
            devices = self.state.tracked_devices(),
            "pipeline stopped",
        );

        Ok(())
    }
}
