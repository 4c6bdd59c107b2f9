use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Compression codecs the output transport understands.
const COMPRESSION_CODECS: &[&str] = &["none", "gzip", "snappy", "lz4", "zstd"];

/// Top-level configuration for the pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broker and topic configuration.
    #[serde(default)]
    pub kafka: KafkaConfig,

    /// Number of consumer workers. Each worker joins the consumer group
    /// independently, so partitions divide across workers. Default: 4.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Output publisher configuration.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Throughput/latency/resource sampling configuration.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// Broker and topic configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Broker address list. Default: "localhost:9092".
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,

    /// Raw login event topic. Default: "user-login".
    #[serde(default = "default_input_topic")]
    pub input_topic: String,

    /// Enriched event topic. Default: "processed-user-login".
    #[serde(default = "default_output_topic")]
    pub output_topic: String,

    /// Consumer group identifier. Default: "user-login-group".
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Offset reset policy for new group members ("earliest" or
    /// "latest"). Default: "earliest", so a new consumer never skips
    /// existing backlog.
    #[serde(default = "default_offset_reset")]
    pub offset_reset: String,

    /// Broker connectivity retry policy for startup and poll failures.
    #[serde(default = "default_broker_retry")]
    pub retry: RetryConfig,
}

/// Output publisher configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Flush once this many buffered payload bytes accumulate. Default: 16384.
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,

    /// Flush a non-empty buffer after this delay even if the byte
    /// threshold was not reached. Default: 5ms.
    #[serde(default = "default_linger", with = "humantime_serde")]
    pub linger: Duration,

    /// Transport compression codec. Default: "snappy".
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Maximum wait for a broker delivery acknowledgment. Default: 30s.
    #[serde(default = "default_ack_timeout", with = "humantime_serde")]
    pub ack_timeout: Duration,

    /// Maximum records queued towards the publisher before workers
    /// block. Default: 8192.
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,

    /// Delivery retry policy per batch.
    #[serde(default = "default_publish_retry")]
    pub retry: RetryConfig,
}

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetryConfig {
    /// Attempt ceiling before the failure escalates.
    pub max_attempts: u32,

    /// Delay before the first retry; doubles each attempt.
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on the backoff delay.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl RetryConfig {
    /// Backoff delay before the given retry (1-based), doubling up to
    /// the configured maximum.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Throughput/latency/resource sampling configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Emit a benchmark sample every this many processed events.
    /// Default: 100.
    #[serde(default = "default_sample_interval")]
    pub sample_interval: u64,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_input_topic() -> String {
    "user-login".to_string()
}

fn default_output_topic() -> String {
    "processed-user-login".to_string()
}

fn default_group_id() -> String {
    "user-login-group".to_string()
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_batch_max_bytes() -> usize {
    16384
}

fn default_linger() -> Duration {
    Duration::from_millis(5)
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_ack_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_queue_size() -> usize {
    8192
}

fn default_broker_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(500),
        max_backoff: Duration::from_secs(30),
    }
}

fn default_publish_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 5,
        initial_backoff: Duration::from_millis(100),
        max_backoff: Duration::from_secs(5),
    }
}

fn default_sample_interval() -> u64 {
    100
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            kafka: KafkaConfig::default(),
            workers: default_workers(),
            publisher: PublisherConfig::default(),
            stats: StatsConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            input_topic: default_input_topic(),
            output_topic: default_output_topic(),
            group_id: default_group_id(),
            offset_reset: default_offset_reset(),
            retry: default_broker_retry(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_max_bytes: default_batch_max_bytes(),
            linger: default_linger(),
            compression: default_compression(),
            ack_timeout: default_ack_timeout(),
            queue_size: default_queue_size(),
            retry: default_publish_retry(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval: default_sample_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Loading, environment overrides, validation ---

impl Config {
    /// Load configuration from a YAML file, apply environment
    /// overrides, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.apply_env();
        cfg.validate()?;

        Ok(cfg)
    }

    /// Defaults plus environment overrides, for running without a
    /// config file.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Recognized environment overrides for the broker surface.
    fn apply_env(&mut self) {
        if let Ok(v) = env::var("BOOTSTRAP_SERVERS") {
            self.kafka.bootstrap_servers = v;
        }
        if let Ok(v) = env::var("KAFKA_TOPIC") {
            self.kafka.input_topic = v;
        }
        if let Ok(v) = env::var("OUTPUT_TOPIC") {
            self.kafka.output_topic = v;
        }
        if let Ok(v) = env::var("GROUP_ID") {
            self.kafka.group_id = v;
        }
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.kafka.bootstrap_servers.is_empty() {
            bail!("kafka.bootstrap_servers is required");
        }
        if self.kafka.input_topic.is_empty() {
            bail!("kafka.input_topic is required");
        }
        if self.kafka.output_topic.is_empty() {
            bail!("kafka.output_topic is required");
        }
        if self.kafka.input_topic == self.kafka.output_topic {
            bail!("kafka.input_topic and kafka.output_topic must differ");
        }
        if self.kafka.group_id.is_empty() {
            bail!("kafka.group_id is required");
        }

        match self.kafka.offset_reset.as_str() {
            "earliest" | "latest" => {}
            other => bail!("invalid kafka.offset_reset: {other}"),
        }

        if self.workers == 0 {
            bail!("workers must be positive");
        }

        if self.publisher.batch_max_bytes == 0 {
            bail!("publisher.batch_max_bytes must be positive");
        }
        if self.publisher.linger.is_zero() {
            bail!("publisher.linger must be positive");
        }
        if self.publisher.queue_size == 0 {
            bail!("publisher.queue_size must be positive");
        }
        if !COMPRESSION_CODECS.contains(&self.publisher.compression.as_str()) {
            bail!(
                "invalid publisher.compression: {}",
                self.publisher.compression
            );
        }

        for (name, retry) in [
            ("kafka.retry", &self.kafka.retry),
            ("publisher.retry", &self.publisher.retry),
        ] {
            if retry.max_attempts == 0 {
                bail!("{name}.max_attempts must be positive");
            }
            if retry.initial_backoff.is_zero() {
                bail!("{name}.initial_backoff must be positive");
            }
            if retry.max_backoff < retry.initial_backoff {
                bail!("{name}.max_backoff must be >= initial_backoff");
            }
        }

        if self.stats.sample_interval == 0 {
            bail!("stats.sample_interval must be positive");
        }

        Ok(())
    }
}
