use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use loginflow::agent::Agent;
use loginflow::config::Config;
use loginflow::consume;

/// Stateful enrichment pipeline for user-login events.
#[derive(Parser)]
#[command(name = "loginflow", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults plus environment
    /// overrides apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,

    /// Create a topic on the broker and exit.
    CreateTopic {
        /// Topic name; defaults to the configured output topic.
        #[arg(long)]
        topic: Option<String>,

        /// Partition count.
        #[arg(long, default_value_t = 1)]
        partitions: i32,

        /// Replication factor.
        #[arg(long, default_value_t = 1)]
        replication: i32,
    },
}

/// Build-time version info.
mod version {
    /// Release version string.
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string.
    pub fn full() -> String {
        format!("{} (commit: {})", RELEASE, git_commit())
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("loginflow {}", version::full());
        return Ok(());
    }

    // Initialize tracing.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt().with_env_filter(filter).with_target(true).init();

    let cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::from_env().context("building config from environment")?,
    };

    tracing::info!(version = version::RELEASE, "starting loginflow");

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Some(Command::CreateTopic {
            topic,
            partitions,
            replication,
        }) => rt.block_on(async {
            let topic = topic.as_deref().unwrap_or(&cfg.kafka.output_topic);
            consume::create_topic(&cfg.kafka, topic, partitions, replication).await
        }),
        // Version was handled above.
        _ => rt.block_on(run(cfg)),
    }
}

async fn run(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register SIGTERM handler");
                    return;
                }
            };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    // Start the pipeline.
    let mut agent = Agent::new(cfg)?;
    agent.start().await?;

    // Run until a shutdown signal or an unrecoverable worker failure.
    let result = tokio::select! {
        _ = &mut shutdown_rx => Ok(()),
        res = agent.wait() => res,
    };

    // Graceful shutdown either way.
    let stop_result = agent.stop().await;

    tracing::info!("loginflow stopped");

    result.and(stop_result)
}
