use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::identity::IdentityKind;

/// One logical counter table: which table to read, the column the identity is matched
/// against, and the column holding the persisted count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterTable {
    pub table: String,
    pub key_column: String,
    pub count_column: String,
}

impl CounterTable {
    pub fn new(
        table: impl Into<String>,
        key_column: impl Into<String>,
        count_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            key_column: key_column.into(),
            count_column: count_column.into(),
        }
    }

    pub fn default_authenticated() -> Self {
        Self::new("user_stats", "user_id", "prompt_count")
    }

    pub fn default_anonymous() -> Self {
        Self::new("guest_tracking", "fingerprint_id", "prompt_count")
    }
}

/// The two tables counts live in, selected by identity kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "UninitializedCounterTables")]
pub struct CounterTables {
    pub authenticated: CounterTable,
    pub anonymous: CounterTable,
}

impl Default for CounterTables {
    fn default() -> Self {
        Self {
            authenticated: CounterTable::default_authenticated(),
            anonymous: CounterTable::default_anonymous(),
        }
    }
}

impl CounterTables {
    pub fn for_kind(&self, kind: IdentityKind) -> &CounterTable {
        match kind {
            IdentityKind::Authenticated => &self.authenticated,
            IdentityKind::Anonymous => &self.anonymous,
        }
    }
}

/// Config-file form of `CounterTables`, where every column may be omitted and falls back
/// to the default for that particular table.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedCounterTables {
    #[serde(default)]
    authenticated: UninitializedCounterTable,
    #[serde(default)]
    anonymous: UninitializedCounterTable,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedCounterTable {
    table: Option<String>,
    key_column: Option<String>,
    count_column: Option<String>,
}

impl UninitializedCounterTable {
    fn load(self, defaults: CounterTable) -> CounterTable {
        CounterTable {
            table: self.table.unwrap_or(defaults.table),
            key_column: self.key_column.unwrap_or(defaults.key_column),
            count_column: self.count_column.unwrap_or(defaults.count_column),
        }
    }
}

impl From<UninitializedCounterTables> for CounterTables {
    fn from(tables: UninitializedCounterTables) -> Self {
        Self {
            authenticated: tables
                .authenticated
                .load(CounterTable::default_authenticated()),
            anonymous: tables.anonymous.load(CounterTable::default_anonymous()),
        }
    }
}

/// Point reads against the remote counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// `SELECT count_column FROM table WHERE key_column = key`.
    ///
    /// Returns `Ok(None)` when no row exists; that is a valid answer, not an error.
    async fn read_count(&self, table: &CounterTable, key: &str) -> Result<Option<u64>, Error>;
}
