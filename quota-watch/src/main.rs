use clap::Parser;
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::signal;

use quota_sync_internal::config_parser::QuotaSyncConfig;
use quota_sync_internal::identity::IdentityInput;
use quota_sync_internal::observability::{
    self, LogFormat, ObserverChain, SyncMetrics, TracingObserver,
};
use quota_sync_internal::quota::QuotaTracker;
use quota_sync_internal::redis_client::RedisClient;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Use the `quota-sync.toml` config file at the specified path. Defaults apply otherwise
    #[arg(long)]
    config_file: Option<PathBuf>,

    /// Device fingerprint of the guest to track
    #[arg(long)]
    fingerprint: Option<String>,

    /// Account to track. Only used together with `--session-valid`
    #[arg(long)]
    account_id: Option<String>,

    /// Treat the account session as valid
    #[arg(long)]
    session_valid: bool,

    /// Sets the log format used for all logs.
    #[arg(long)]
    #[arg(value_enum)]
    #[clap(default_value_t = LogFormat::default())]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    observability::setup_observability(args.log_format).expect_pretty("Failed to set up logs");

    tracing::info!("Starting quota-watch {}", env!("CARGO_PKG_VERSION"));

    let config = match &args.config_file {
        Some(path) => QuotaSyncConfig::load_and_verify_from_path(path)
            .await
            .ok() // Don't print the error here, since it was already printed when it was constructed
            .expect_pretty("Failed to load config"),
        None => {
            tracing::warn!("No config file provided, using defaults. Use `--config-file path/to/quota-sync.toml` to specify one.");
            QuotaSyncConfig::default()
        }
    };

    let redis = Arc::new(
        RedisClient::new(&config.redis.url)
            .await
            .ok()
            .expect_pretty("Failed to connect to Redis"),
    );
    let metrics = Arc::new(SyncMetrics::default());
    let observer = ObserverChain::new()
        .with(Arc::new(TracingObserver))
        .with(metrics.clone());
    let tracker = QuotaTracker::from_config(&config, redis.clone(), redis, Arc::new(observer));

    let input = IdentityInput {
        fingerprint: args.fingerprint,
        account_id: args.account_id,
        session_valid: args.session_valid,
    };
    if input.resolve().is_none() {
        tracing::warn!("Neither `--fingerprint` nor a valid `--account-id` was given, nothing will be tracked");
    }

    let mut receiver = tracker.subscribe();
    tracker.set_identity(input).await;
    log_state(&tracker);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = receiver.changed() => {
                if changed.is_err() {
                    break;
                }
                log_state(&tracker);
            }
            _ = &mut shutdown => break,
        }
    }

    tracker.shutdown().await;
    log_metrics(&metrics);
    tracing::info!("Stopped tracking");
}

fn log_metrics(metrics: &SyncMetrics) {
    tracing::info!(
        fetches = metrics.fetches.load(Ordering::Relaxed),
        fetch_errors = metrics.fetch_errors.load(Ordering::Relaxed),
        fetches_discarded = metrics.fetches_discarded.load(Ordering::Relaxed),
        subscriptions_opened = metrics.subscriptions_opened.load(Ordering::Relaxed),
        subscription_errors = metrics.subscription_errors.load(Ordering::Relaxed),
        feed_events_applied = metrics.feed_events_applied.load(Ordering::Relaxed),
        "Sync metrics"
    );
}

fn log_state(tracker: &QuotaTracker) {
    let state = tracker.state();
    let rendered = serde_json::to_string(&state).unwrap_or_else(|e| format!("{state:?} ({e})"));
    match (&state.error, state.is_exhausted()) {
        (Some(error), _) => tracing::warn!(state = %rendered, "Quota state has an error: {error}"),
        (None, true) => tracing::info!(state = %rendered, "Prompt limit reached"),
        (None, false) => tracing::info!(
            state = %rendered,
            "{} of {} prompts used",
            state.prompt_count,
            state.max_prompts
        ),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect_pretty("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect_pretty("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal");
        }
    };
}

/// We don't allow panic, expect, unwrap, or similar methods in the codebase, except for the
/// private `expect_pretty` method, which is to be used only in main.rs during initialization.
///
/// `expect_pretty` logs the error message and exits with a status code of 1.
trait ExpectPretty<T> {
    fn expect_pretty(self, msg: &str) -> T;
}

impl<T, E: Display> ExpectPretty<T> for Result<T, E> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Ok(value) => value,
            Err(err) => {
                tracing::error!("{msg}: {err}");
                std::process::exit(1);
            }
        }
    }
}

impl<T> ExpectPretty<T> for Option<T> {
    fn expect_pretty(self, msg: &str) -> T {
        match self {
            Some(value) => value,
            None => {
                tracing::error!("{msg}");
                std::process::exit(1);
            }
        }
    }
}
