use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::instrument;

use crate::error::{Error, ErrorDetails};
use crate::identity::Identity;
use crate::quota::{CeilingPolicy, QuotaRecord};
use crate::store::{CounterStore, CounterTables};

/// Point reads of the persisted count for one identity
#[derive(Clone)]
pub struct CounterFetcher {
    store: Arc<dyn CounterStore>,
    tables: CounterTables,
    ceilings: CeilingPolicy,
    fetch_timeout: Duration,
}

impl CounterFetcher {
    pub fn new(
        store: Arc<dyn CounterStore>,
        tables: CounterTables,
        ceilings: CeilingPolicy,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            store,
            tables,
            ceilings,
            fetch_timeout,
        }
    }

    pub fn tables(&self) -> &CounterTables {
        &self.tables
    }

    pub fn ceilings(&self) -> &CeilingPolicy {
        &self.ceilings
    }

    /// Read the current count for `identity`. A missing row is a count of zero.
    #[instrument(skip(self, identity), fields(%identity))]
    pub async fn fetch(&self, identity: &Identity) -> Result<QuotaRecord, Error> {
        let table = self.tables.for_kind(identity.kind());
        let ceiling = self.ceilings.ceiling_for(identity.kind());

        let count = match timeout(
            self.fetch_timeout,
            self.store.read_count(table, identity.value()),
        )
        .await
        {
            Ok(Ok(Some(count))) => count,
            Ok(Ok(None)) => {
                tracing::debug!("No row in `{}`, treating as zero", table.table);
                0
            }
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::new(ErrorDetails::FetchTimeout {
                    table: table.table.clone(),
                    timeout_ms: self.fetch_timeout.as_millis() as u64,
                }))
            }
        };

        Ok(QuotaRecord { count, ceiling })
    }
}
