use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::instrument;

use crate::config_parser::QuotaSyncConfig;
use crate::feed::{ChangeFeed, SubscriptionKey, SubscriptionTarget};
use crate::identity::{Identity, IdentityInput};
use crate::observability::{DiscardReason, SyncEvent, SyncObserver};
use crate::quota::{CounterFetcher, LiveSyncManager, QuotaState};
use crate::store::CounterStore;

/// Bookkeeping that decides whether an async result is still relevant when it lands
#[derive(Debug, Default)]
struct Tracking {
    /// Bumped on every identity change and on shutdown
    generation: u64,
    /// Number of feed events applied in the current generation
    feed_seq: u64,
    /// Last fetch ticket handed out / applied, so an older refetch never overwrites a newer one
    fetch_ticket: u64,
    applied_ticket: u64,
    in_flight: u32,
    input: Option<IdentityInput>,
    identity: Option<Identity>,
    shut_down: bool,
}

/// State shared between the tracker and the change-feed listener task
pub(crate) struct TrackerShared {
    tracking: Mutex<Tracking>,
    state: watch::Sender<QuotaState>,
    observer: Arc<dyn SyncObserver>,
}

/// What a fetch needs to remember about the moment it was issued
#[derive(Debug, Clone, Copy)]
struct FetchTicket {
    generation: u64,
    feed_seq: u64,
    ticket: u64,
}

impl TrackerShared {
    fn new(observer: Arc<dyn SyncObserver>) -> Self {
        let (state, _) = watch::channel(QuotaState::default());
        Self {
            tracking: Mutex::new(Tracking::default()),
            state,
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Tracking> {
        // Nothing in `Tracking` can be left half-updated by a panic, so poisoning is harmless
        self.tracking.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<QuotaState> {
        self.state.subscribe()
    }

    pub(crate) fn snapshot(&self) -> QuotaState {
        self.state.borrow().clone()
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.lock().generation
    }

    /// Overwrite the count with a change-feed value, unless `generation` is stale.
    pub(crate) fn apply_feed_count(&self, generation: u64, count: u64) -> bool {
        let mut tracking = self.lock();
        if tracking.generation != generation {
            return false;
        }
        tracking.feed_seq += 1;
        self.state.send_if_modified(|state| {
            let changed = state.prompt_count != count;
            state.prompt_count = count;
            changed
        });
        true
    }

    /// Mutate the published state only if `generation` is still current
    fn update_if_current(&self, generation: u64, f: impl FnOnce(&mut QuotaState)) -> bool {
        let tracking = self.lock();
        if tracking.generation != generation {
            return false;
        }
        self.state.send_modify(f);
        true
    }

    fn issue_fetch(&self, generation: u64) -> Option<FetchTicket> {
        let mut tracking = self.lock();
        if tracking.generation != generation {
            return None;
        }
        tracking.fetch_ticket += 1;
        tracking.in_flight += 1;
        let ticket = FetchTicket {
            generation,
            feed_seq: tracking.feed_seq,
            ticket: tracking.fetch_ticket,
        };
        self.state.send_if_modified(|state| {
            let changed = !state.loading || state.error.is_some();
            state.loading = true;
            state.error = None;
            changed
        });
        Some(ticket)
    }

    #[cfg(test)]
    pub(crate) fn new_for_test(observer: Arc<dyn SyncObserver>, generation: u64) -> Arc<Self> {
        let shared = Self::new(observer);
        shared.lock().generation = generation;
        Arc::new(shared)
    }

    #[cfg(test)]
    pub(crate) fn advance_generation_for_test(&self) {
        self.lock().generation += 1;
    }
}

/// Tracks how many prompts the active identity has used and keeps that number live.
///
/// Cheap to clone; all clones drive the same state. Errors never escape: fetch failures land in
/// `QuotaState::error`, subscription failures only degrade to fetch-only mode.
#[derive(Clone)]
pub struct QuotaTracker {
    inner: Arc<TrackerInner>,
}

struct TrackerInner {
    shared: Arc<TrackerShared>,
    fetcher: CounterFetcher,
    live_sync: tokio::sync::Mutex<LiveSyncManager>,
}

impl QuotaTracker {
    pub fn new(
        fetcher: CounterFetcher,
        feed: Arc<dyn ChangeFeed>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        let shared = Arc::new(TrackerShared::new(observer.clone()));
        Self {
            inner: Arc::new(TrackerInner {
                shared,
                fetcher,
                live_sync: tokio::sync::Mutex::new(LiveSyncManager::new(feed, observer)),
            }),
        }
    }

    /// Build a tracker from config. Pass `Arc::new(TracingObserver)` for plain logging.
    pub fn from_config(
        config: &QuotaSyncConfig,
        store: Arc<dyn CounterStore>,
        feed: Arc<dyn ChangeFeed>,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        let fetcher = CounterFetcher::new(
            store,
            config.tables.clone(),
            config.ceilings,
            config.redis.fetch_timeout(),
        );
        Self::new(fetcher, feed, observer)
    }

    /// Receiver that yields every published `QuotaState`
    pub fn subscribe(&self) -> watch::Receiver<QuotaState> {
        self.inner.shared.subscribe()
    }

    pub fn state(&self) -> QuotaState {
        self.inner.shared.snapshot()
    }

    pub fn generation(&self) -> u64 {
        self.inner.shared.current_generation()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.shared.lock().identity.clone()
    }

    /// Key of the open change-feed subscription, if live updates are running
    pub async fn active_subscription(&self) -> Option<SubscriptionKey> {
        self.inner.live_sync.lock().await.active_key().cloned()
    }

    /// Track a new set of identity inputs.
    ///
    /// Does nothing if the inputs are unchanged. Otherwise the previous subscription is closed,
    /// the count is fetched for the new identity and a subscription scoped to it is opened.
    #[instrument(skip(self))]
    pub async fn set_identity(&self, input: IdentityInput) {
        let shared = &self.inner.shared;
        let (generation, identity, identity_changed) = {
            let mut tracking = shared.lock();
            if !tracking.shut_down && tracking.input.as_ref() == Some(&input) {
                tracing::debug!("Identity inputs unchanged, nothing to do");
                return;
            }
            let identity = input.resolve();
            let identity_changed = tracking.identity != identity;
            tracking.generation += 1;
            tracking.feed_seq = 0;
            tracking.in_flight = 0;
            tracking.input = Some(input);
            tracking.identity = identity.clone();
            tracking.shut_down = false;
            (tracking.generation, identity, identity_changed)
        };

        self.inner.live_sync.lock().await.close().await;

        let Some(identity) = identity else {
            tracing::debug!("No identity to track yet");
            let ceiling = self.inner.fetcher.ceilings().anonymous;
            shared.update_if_current(generation, |state| {
                state.prompt_count = 0;
                state.max_prompts = ceiling;
                state.loading = false;
                state.error = None;
            });
            return;
        };

        let ceiling = self.inner.fetcher.ceilings().ceiling_for(identity.kind());
        shared.update_if_current(generation, |state| {
            if identity_changed {
                state.prompt_count = 0;
            }
            state.max_prompts = ceiling;
        });

        self.run_fetch(generation, &identity).await;

        // Live updates are attempted whatever the fetch outcome: a later write may get through
        // where the read did not.
        let target = SubscriptionTarget::for_identity(self.inner.fetcher.tables(), &identity);
        let mut live_sync = self.inner.live_sync.lock().await;
        if shared.current_generation() != generation {
            return;
        }
        if live_sync
            .open(target, generation, shared.clone())
            .await
            .is_err()
        {
            tracing::debug!("Tracking {identity} without live updates");
        }
    }

    /// Re-read the count for the current identity. The subscription is left as it is.
    #[instrument(skip(self))]
    pub async fn refetch(&self) {
        let (generation, identity) = {
            let tracking = self.inner.shared.lock();
            if tracking.shut_down {
                return;
            }
            (tracking.generation, tracking.identity.clone())
        };
        match identity {
            Some(identity) => self.run_fetch(generation, &identity).await,
            None => {
                self.inner.shared.update_if_current(generation, |state| {
                    state.loading = false;
                });
            }
        }
    }

    /// Stop tracking: outstanding fetches are discarded and the subscription is closed.
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        {
            let mut tracking = self.inner.shared.lock();
            if !tracking.shut_down {
                tracking.generation += 1;
                tracking.in_flight = 0;
                tracking.shut_down = true;
            }
        }
        self.inner.shared.state.send_if_modified(|state| {
            let changed = state.loading;
            state.loading = false;
            changed
        });
        self.inner.live_sync.lock().await.close().await;
    }

    async fn run_fetch(&self, generation: u64, identity: &Identity) {
        let shared = &self.inner.shared;
        let Some(ticket) = shared.issue_fetch(generation) else {
            return;
        };

        let result = self.inner.fetcher.fetch(identity).await;

        let outcome = {
            let mut tracking = shared.lock();
            if tracking.generation != ticket.generation {
                Err(DiscardReason::StaleGeneration)
            } else {
                tracking.in_flight = tracking.in_flight.saturating_sub(1);
                let loading = tracking.in_flight > 0;
                let fresh = tracking.feed_seq == ticket.feed_seq
                    && ticket.ticket > tracking.applied_ticket;
                match &result {
                    Ok(record) => {
                        if fresh {
                            tracking.applied_ticket = ticket.ticket;
                        }
                        shared.state.send_modify(|state| {
                            if fresh {
                                state.prompt_count = record.count;
                            }
                            state.max_prompts = record.ceiling;
                            state.loading = loading;
                            state.error = None;
                        });
                    }
                    Err(e) => {
                        // Keep the last known count rather than flashing a false zero
                        shared.state.send_modify(|state| {
                            state.loading = loading;
                            state.error = Some(e.to_string());
                        });
                    }
                }
                Ok(fresh)
            }
        };

        let observer = &shared.observer;
        match (outcome, &result) {
            (Err(reason), _) => observer.on_event(&SyncEvent::FetchDiscarded {
                identity,
                generation,
                reason,
            }),
            (Ok(_), Err(error)) => observer.on_event(&SyncEvent::FetchFailed {
                identity,
                generation,
                error,
            }),
            (Ok(true), Ok(record)) => observer.on_event(&SyncEvent::FetchSucceeded {
                identity,
                generation,
                count: record.count,
            }),
            (Ok(false), Ok(_)) => observer.on_event(&SyncEvent::FetchDiscarded {
                identity,
                generation,
                reason: DiscardReason::Superseded,
            }),
        }
    }
}
