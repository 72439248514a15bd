use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use rand::Rng;
use serde::Serialize;
use tokio::signal;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use quotagate::clock::system_clock;
use quotagate::config::{AppConfig, LoggingConfig};
use quotagate::manager::RateLimitingManager;
use quotagate::quota::{InMemoryQuotaStore, QuotaTrackingService};
use quotagate::ratelimit::{ApiErrorKind, EventKind, ProcessingStrategy, RateLimitEvent};

#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about = "Adaptive rate limiting for AI provider calls")]
struct Cli {
    /// Configuration file (YAML); QUOTAGATE__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the limits of every processing strategy
    Presets,
    /// Push a batch of simulated documents through the limiter
    Simulate(SimulateArgs),
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Number of documents to process
    #[arg(long, default_value_t = 40)]
    documents: usize,

    /// Documents processed concurrently
    #[arg(long, default_value_t = 8)]
    workers: usize,

    /// Strategy to use instead of the configured one
    #[arg(long)]
    strategy: Option<ProcessingStrategy>,

    /// Probability that the provider throttles a call
    #[arg(long, default_value_t = 0.05)]
    rate_limit_probability: f64,

    /// Probability that a call times out
    #[arg(long, default_value_t = 0.03)]
    timeout_probability: f64,

    /// Attempts per document before giving up
    #[arg(long, default_value_t = 4)]
    max_attempts: u32,

    /// Upper bound on a single wait between permission checks
    #[arg(long, default_value_t = 5_000)]
    max_wait_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Presets => print_presets(),
        Command::Simulate(args) => simulate(config, args).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_presets() -> anyhow::Result<()> {
    let presets: BTreeMap<_, _> = ProcessingStrategy::ALL
        .iter()
        .map(|strategy| (strategy.as_str(), strategy.config()))
        .collect();
    println!("{}", serde_json::to_string_pretty(&presets)?);
    Ok(())
}

/// Outcome of one fake provider call.
struct ProviderReply {
    tokens: u64,
    response_time_ms: u64,
}

/// Stand-in for the AI provider: random latency, occasional throttling and timeouts.
struct FakeProvider {
    rate_limit_probability: f64,
    timeout_probability: f64,
}

impl FakeProvider {
    async fn extract(&self, estimated_tokens: u64) -> Result<ProviderReply, ApiErrorKind> {
        let (latency_ms, roll, scale) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(50..250), rng.gen::<f64>(), rng.gen_range(0.8..1.2))
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if roll < self.rate_limit_probability {
            Err(ApiErrorKind::RateLimit)
        } else if roll < self.rate_limit_probability + self.timeout_probability {
            Err(ApiErrorKind::Timeout)
        } else {
            Ok(ProviderReply {
                tokens: (estimated_tokens as f64 * scale).round() as u64,
                response_time_ms: latency_ms,
            })
        }
    }
}

#[derive(Debug, Default, Serialize)]
struct SimulationReport {
    succeeded: usize,
    failed: usize,
    denials: usize,
    events: BTreeMap<String, u64>,
}

async fn simulate(config: AppConfig, args: SimulateArgs) -> anyhow::Result<()> {
    let strategy = args.strategy.unwrap_or(config.limiter.strategy);
    let mut limiter_config = config.limiter.rate_limit_config()?;
    if args.strategy.is_some() {
        limiter_config = strategy.config();
    }

    let clock = system_clock();
    let ledger = config.quota.persistent_tracking.then(|| {
        Arc::new(QuotaTrackingService::with_options(
            Arc::new(InMemoryQuotaStore::new()),
            config.quota.cache_ttl(),
            clock.clone(),
        ))
    });
    let cleanup = ledger.as_ref().map(|ledger| {
        ledger.spawn_cleanup(config.quota.cleanup_interval(), config.quota.retention_days)
    });

    let manager = Arc::new(RateLimitingManager::with_config(
        config.quota.provider.clone(),
        strategy,
        limiter_config,
        ledger,
        clock,
    ));

    manager
        .events()
        .add_listener(Arc::new(|event: &RateLimitEvent| -> anyhow::Result<()> {
            if event.kind == EventKind::BackoffApplied {
                warn!(delay_ms = ?event.delay_ms, "Provider throttled, backing off");
            }
            Ok(())
        }));

    let mut events = manager.events().stream();
    let tally = tokio::spawn(async move {
        let mut counts = BTreeMap::<String, u64>::new();
        while let Some(event) = events.next().await {
            // Lagged receivers skip ahead; only delivered events are counted
            if let Ok(event) = event {
                let kind = serde_json::to_value(event.kind)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_default();
                *counts.entry(kind).or_default() += 1;
            }
        }
        counts
    });

    info!(
        documents = args.documents,
        workers = args.workers,
        strategy = %strategy,
        provider = %manager.api_provider(),
        persistent_tracking = manager.persistent_tracking(),
        "Starting simulation"
    );

    let provider = Arc::new(FakeProvider {
        rate_limit_probability: args.rate_limit_probability,
        timeout_probability: args.timeout_probability,
    });

    let (max_attempts, max_wait_ms) = (args.max_attempts, args.max_wait_ms);
    let run = futures::stream::iter(0..args.documents)
        .map(|index| {
            let manager = manager.clone();
            let provider = provider.clone();
            async move {
                process_document(&manager, &provider, index, max_attempts, max_wait_ms).await
            }
        })
        .buffer_unordered(args.workers.max(1))
        .collect::<Vec<_>>();

    let results = tokio::select! {
        results = run => results,
        _ = shutdown_signal() => {
            warn!("Simulation interrupted");
            Vec::new()
        }
    };

    if let Some(cleanup) = cleanup {
        cleanup.abort();
    }

    let mut report = SimulationReport::default();
    for result in results {
        match result {
            Ok((true, denials)) => {
                report.succeeded += 1;
                report.denials += denials;
            }
            Ok((false, denials)) => {
                report.failed += 1;
                report.denials += denials;
            }
            Err(e) => {
                warn!(error = %e, "Document processing aborted");
                report.failed += 1;
            }
        }
    }

    let status = manager.status().await;
    let statistics = manager.quota_statistics(1).await?;
    // The event stream ends once the last limiter holding the bus is gone
    drop(manager);
    report.events = tokio::time::timeout(Duration::from_secs(1), tally)
        .await
        .ok()
        .and_then(Result::ok)
        .unwrap_or_default();

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "report": report,
            "status": status,
            "statistics": statistics,
        }))?
    );
    Ok(())
}

/// Process one document, waiting out denials and retrying failed calls.
///
/// Returns whether the document succeeded and how many denials it saw.
async fn process_document(
    manager: &RateLimitingManager,
    provider: &FakeProvider,
    index: usize,
    max_attempts: u32,
    max_wait_ms: u64,
) -> anyhow::Result<(bool, usize)> {
    let estimated_tokens = 500 + (index as u64 % 7) * 250;
    let mut denials = 0;
    let mut attempts = 0;

    while attempts < max_attempts {
        let request_id = Uuid::new_v4().to_string();
        let permission = manager.acquire_permission(&request_id, estimated_tokens).await?;
        if !permission.allowed {
            denials += 1;
            debug!(
                index,
                reason = ?permission.reason,
                delay_ms = permission.delay_ms,
                "Waiting for permission"
            );
            let wait_ms = permission.delay_ms.clamp(10, max_wait_ms);
            tokio::time::sleep(Duration::from_millis(wait_ms)).await;
            continue;
        }

        attempts += 1;
        match provider.extract(estimated_tokens).await {
            Ok(reply) => {
                manager
                    .record_success(&request_id, reply.tokens, Some(reply.response_time_ms))
                    .await?;
                debug!(index, tokens = reply.tokens, "Document processed");
                return Ok((true, denials));
            }
            Err(kind) => {
                manager.record_error(&request_id, kind).await?;
                debug!(index, error_type = %kind, attempt = attempts, "Provider call failed");
            }
        }
    }

    warn!(index, attempts, "Giving up on document");
    Ok((false, denials))
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping");
        }
    }
}
