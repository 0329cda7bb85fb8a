use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::error::{Error, ErrorDetails};
use crate::feed::SubscriptionKey;
use crate::identity::Identity;

const DEFAULT_LOG_FILTER: &str = "warn,quota_sync_internal=info,quota_watch=info";

#[derive(clap::ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` overrides the default filter.
pub fn setup_observability(log_format: LogFormat) -> Result<(), Error> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match log_format {
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
    };

    result.map_err(|e| {
        Error::new(ErrorDetails::Observability {
            message: format!("Failed to install tracing subscriber: {e}"),
        })
    })
}

/// Why a fetch result was thrown away instead of being applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// The identity changed (or the tracker shut down) while the fetch was in flight
    StaleGeneration,
    /// A change-feed event or a newer fetch landed after this fetch was issued
    Superseded,
}

/// Everything the sync machinery reports to the injected observer
#[derive(Debug)]
pub enum SyncEvent<'a> {
    FetchSucceeded {
        identity: &'a Identity,
        generation: u64,
        count: u64,
    },
    FetchFailed {
        identity: &'a Identity,
        generation: u64,
        error: &'a Error,
    },
    FetchDiscarded {
        identity: &'a Identity,
        generation: u64,
        reason: DiscardReason,
    },
    SubscriptionOpened {
        key: &'a SubscriptionKey,
        generation: u64,
    },
    SubscriptionClosed {
        key: &'a SubscriptionKey,
        generation: u64,
    },
    SubscriptionFailed {
        key: &'a SubscriptionKey,
        generation: u64,
        error: &'a Error,
    },
    FeedEventApplied {
        key: &'a SubscriptionKey,
        generation: u64,
        count: u64,
    },
    FeedEventIgnored {
        key: &'a SubscriptionKey,
        generation: u64,
    },
    FeedEnded {
        key: &'a SubscriptionKey,
        generation: u64,
    },
}

/// Caller-injected hook for logs and metrics
pub trait SyncObserver: Send + Sync {
    fn on_event(&self, event: &SyncEvent<'_>);
}

/// Default observer: one `tracing` event per sync event.
///
/// Failures are already logged when their `Error` is constructed, so they only get a debug line here.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_event(&self, event: &SyncEvent<'_>) {
        match event {
            SyncEvent::FetchSucceeded {
                identity,
                generation,
                count,
            } => tracing::debug!(%identity, generation, count, "Fetched prompt count"),
            SyncEvent::FetchFailed {
                identity,
                generation,
                error,
            } => tracing::debug!(%identity, generation, "Failed to fetch prompt count: {error}"),
            SyncEvent::FetchDiscarded {
                identity,
                generation,
                reason,
            } => tracing::debug!(%identity, generation, ?reason, "Discarded fetch result"),
            SyncEvent::SubscriptionOpened { key, generation } => {
                tracing::info!(%key, generation, "Opened change-feed subscription")
            }
            SyncEvent::SubscriptionClosed { key, generation } => {
                tracing::info!(%key, generation, "Closed change-feed subscription")
            }
            SyncEvent::SubscriptionFailed {
                key,
                generation,
                error,
            } => tracing::debug!(
                %key,
                generation,
                "Live updates unavailable, falling back to fetch-only: {error}"
            ),
            SyncEvent::FeedEventApplied {
                key,
                generation,
                count,
            } => tracing::debug!(%key, generation, count, "Applied change-feed update"),
            SyncEvent::FeedEventIgnored { key, generation } => {
                tracing::trace!(%key, generation, "Ignored change-feed event without a count")
            }
            SyncEvent::FeedEnded { key, generation } => {
                tracing::warn!(%key, generation, "Change feed closed by the remote side")
            }
        }
    }
}

/// Counters for the sync machinery
#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub fetches: AtomicU64,
    pub fetch_errors: AtomicU64,
    pub fetches_discarded: AtomicU64,
    pub subscriptions_opened: AtomicU64,
    pub subscriptions_closed: AtomicU64,
    pub subscription_errors: AtomicU64,
    pub feed_events_applied: AtomicU64,
}

impl SyncMetrics {
    /// Subscriptions currently open according to the recorded events
    pub fn open_subscriptions(&self) -> u64 {
        self.subscriptions_opened
            .load(Ordering::Relaxed)
            .saturating_sub(self.subscriptions_closed.load(Ordering::Relaxed))
    }
}

impl SyncObserver for SyncMetrics {
    fn on_event(&self, event: &SyncEvent<'_>) {
        let counter = match event {
            SyncEvent::FetchSucceeded { .. } => &self.fetches,
            SyncEvent::FetchFailed { .. } => &self.fetch_errors,
            SyncEvent::FetchDiscarded { .. } => &self.fetches_discarded,
            SyncEvent::SubscriptionOpened { .. } => &self.subscriptions_opened,
            SyncEvent::SubscriptionClosed { .. } => &self.subscriptions_closed,
            SyncEvent::SubscriptionFailed { .. } => &self.subscription_errors,
            SyncEvent::FeedEventApplied { .. } => &self.feed_events_applied,
            SyncEvent::FeedEventIgnored { .. } | SyncEvent::FeedEnded { .. } => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Fans every event out to several observers, in order
#[derive(Default, Clone)]
pub struct ObserverChain(Vec<Arc<dyn SyncObserver>>);

impl ObserverChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.0.push(observer);
        self
    }
}

impl SyncObserver for ObserverChain {
    fn on_event(&self, event: &SyncEvent<'_>) {
        for observer in &self.0 {
            observer.on_event(event);
        }
    }
}
