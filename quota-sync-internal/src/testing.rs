#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::error::{Error, ErrorDetails};
use crate::feed::{ChangeEvent, ChangeFeed, ChangeStream, SubscriptionTarget};
use crate::quota::QuotaState;
use crate::store::{CounterStore, CounterTable};

const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Counter store backed by a map, with scripted failures and reads that can be held open
#[derive(Default)]
pub struct InMemoryCounterStore {
    inner: Mutex<StoreInner>,
}

#[derive(Default)]
struct StoreInner {
    rows: HashMap<(String, String), u64>,
    reads: Vec<(String, String)>,
    failures: VecDeque<String>,
    gates: VecDeque<oneshot::Receiver<()>>,
}

/// Holds the gated read until released (or dropped)
pub struct ReadGate(oneshot::Sender<()>);

impl ReadGate {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

impl InMemoryCounterStore {
    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap()
    }

    pub fn set_count(&self, table: &str, key: &str, count: u64) {
        self.lock()
            .rows
            .insert((table.to_string(), key.to_string()), count);
    }

    pub fn fail_next_read(&self, message: &str) {
        self.lock().failures.push_back(message.to_string());
    }

    /// The next read captures the row as it is now, then waits for the gate before returning
    pub fn gate_next_read(&self) -> ReadGate {
        let (tx, rx) = oneshot::channel();
        self.lock().gates.push_back(rx);
        ReadGate(tx)
    }

    pub fn reads(&self) -> Vec<(String, String)> {
        self.lock().reads.clone()
    }

    /// Yield until at least `count` reads have been issued
    pub async fn wait_for_reads(&self, count: usize) {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            while self.lock().reads.len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("Expected {count} counter reads"));
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn read_count(&self, table: &CounterTable, key: &str) -> Result<Option<u64>, Error> {
        let (result, gate) = {
            let mut inner = self.lock();
            inner.reads.push((table.table.clone(), key.to_string()));
            let result = match inner.failures.pop_front() {
                Some(message) => Err(Error::new(ErrorDetails::Fetch {
                    table: table.table.clone(),
                    message,
                })),
                None => Ok(inner
                    .rows
                    .get(&(table.table.clone(), key.to_string()))
                    .copied()),
            };
            (result, inner.gates.pop_front())
        };
        if let Some(gate) = gate {
            let _ = gate.await;
        }
        result
    }
}

/// Change feed whose events are pushed by the test
#[derive(Default)]
pub struct InMemoryChangeFeed {
    inner: Mutex<FeedInner>,
}

#[derive(Default)]
struct FeedInner {
    senders: HashMap<String, mpsc::UnboundedSender<ChangeEvent>>,
    opened: Vec<String>,
    live_at_open: Vec<usize>,
    failures: VecDeque<String>,
}

impl FeedInner {
    fn live(&self) -> usize {
        self.senders.values().filter(|tx| !tx.is_closed()).count()
    }
}

impl InMemoryChangeFeed {
    fn lock(&self) -> MutexGuard<'_, FeedInner> {
        self.inner.lock().unwrap()
    }

    pub fn fail_next_subscribe(&self, message: &str) {
        self.lock().failures.push_back(message.to_string());
    }

    /// Deliver an event to the subscriber of `key`. Returns `false` if nobody is listening.
    pub fn push(&self, key: &str, event: ChangeEvent) -> bool {
        self.lock()
            .senders
            .get(key)
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    /// End the stream for `key` from the remote side
    pub fn end(&self, key: &str) {
        self.lock().senders.remove(key);
    }

    pub fn is_subscribed(&self, key: &str) -> bool {
        self.lock()
            .senders
            .get(key)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn live_subscriptions(&self) -> usize {
        self.lock().live()
    }

    /// Subscription keys in the order they were opened
    pub fn opened(&self) -> Vec<String> {
        self.lock().opened.clone()
    }

    /// For each `subscribe` call, how many other subscriptions were still live at that moment
    pub fn live_subscriptions_at_open(&self) -> Vec<usize> {
        self.lock().live_at_open.clone()
    }

    pub async fn wait_until_unsubscribed(&self, key: &str) {
        let sender = self.lock().senders.get(key).cloned();
        if let Some(sender) = sender {
            tokio::time::timeout(WAIT_TIMEOUT, sender.closed())
                .await
                .unwrap_or_else(|_| panic!("`{key}` was never unsubscribed"));
        }
    }
}

#[async_trait]
impl ChangeFeed for InMemoryChangeFeed {
    async fn subscribe(&self, target: &SubscriptionTarget) -> Result<ChangeStream, Error> {
        let mut inner = self.lock();
        if let Some(message) = inner.failures.pop_front() {
            return Err(Error::new(ErrorDetails::Subscription {
                channel: target.key.to_string(),
                message,
            }));
        }
        let live = inner.live();
        inner.live_at_open.push(live);
        let (tx, rx) = mpsc::unbounded_channel();
        inner.senders.insert(target.key.to_string(), tx);
        inner.opened.push(target.key.to_string());
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// Wait until the published state satisfies `predicate`, failing the test after a few seconds
pub async fn wait_for_state(
    receiver: &mut watch::Receiver<QuotaState>,
    predicate: impl FnMut(&QuotaState) -> bool,
) -> QuotaState {
    let state = tokio::time::timeout(WAIT_TIMEOUT, receiver.wait_for(predicate))
        .await
        .unwrap_or_else(|_| panic!("Timed out waiting for quota state"))
        .unwrap();
    (*state).clone()
}
