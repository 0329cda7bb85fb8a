use std::sync::Arc;

use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::instrument;

use crate::error::Error;
use crate::feed::{ChangeFeed, SubscriptionKey, SubscriptionTarget};
use crate::observability::{SyncEvent, SyncObserver};
use crate::quota::tracker::TrackerShared;

/// The one open change-feed subscription, tagged with the identity generation it serves
struct ActiveSubscription {
    key: SubscriptionKey,
    generation: u64,
    task: JoinHandle<()>,
}

/// Keeps the published count in step with the counter store by listening to its change feed.
///
/// Holds at most one subscription. Opening a new one always closes the previous one first,
/// and closing waits until the listener task (and with it the feed connection) is gone.
pub struct LiveSyncManager {
    feed: Arc<dyn ChangeFeed>,
    observer: Arc<dyn SyncObserver>,
    active: Option<ActiveSubscription>,
}

impl LiveSyncManager {
    pub fn new(feed: Arc<dyn ChangeFeed>, observer: Arc<dyn SyncObserver>) -> Self {
        Self {
            feed,
            observer,
            active: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_key(&self) -> Option<&SubscriptionKey> {
        self.active.as_ref().map(|active| &active.key)
    }

    /// Subscribe to `target` on behalf of `generation`.
    ///
    /// On failure the manager is left with no subscription; the caller keeps the last fetched count.
    #[instrument(skip(self, target, sink), fields(key = %target.key))]
    pub(crate) async fn open(
        &mut self,
        target: SubscriptionTarget,
        generation: u64,
        sink: Arc<TrackerShared>,
    ) -> Result<(), Error> {
        self.close().await;

        let stream = match self.feed.subscribe(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                self.observer.on_event(&SyncEvent::SubscriptionFailed {
                    key: &target.key,
                    generation,
                    error: &e,
                });
                return Err(e);
            }
        };

        let key = target.key;
        let observer = self.observer.clone();
        let task_key = key.clone();
        let task = tokio::spawn(async move {
            let mut stream = stream;
            while let Some(event) = stream.next().await {
                let Some(count) = event.new_count else {
                    observer.on_event(&SyncEvent::FeedEventIgnored {
                        key: &task_key,
                        generation,
                    });
                    continue;
                };
                if !sink.apply_feed_count(generation, count) {
                    // The identity moved on; the owner is about to close us
                    return;
                }
                observer.on_event(&SyncEvent::FeedEventApplied {
                    key: &task_key,
                    generation,
                    count,
                });
            }
            observer.on_event(&SyncEvent::FeedEnded {
                key: &task_key,
                generation,
            });
        });

        self.observer
            .on_event(&SyncEvent::SubscriptionOpened { key: &key, generation });
        self.active = Some(ActiveSubscription {
            key,
            generation,
            task,
        });
        Ok(())
    }

    /// Close the open subscription, if any. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.task.abort();
        // Wait for the task to be dropped so its stream is unsubscribed before we return
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                tracing::error!("Change-feed listener for `{}` panicked: {e}", active.key);
            }
        }
        self.observer.on_event(&SyncEvent::SubscriptionClosed {
            key: &active.key,
            generation: active.generation,
        });
    }
}

impl Drop for LiveSyncManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}
