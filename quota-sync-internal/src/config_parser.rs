use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails};
use crate::quota::ceiling::CeilingPolicy;
use crate::store::{CounterTable, CounterTables};

/// Top-level configuration, usually loaded from `quota-sync.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaSyncConfig {
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub ceilings: CeilingPolicy,
    #[serde(default)]
    pub tables: CounterTables,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Upper bound on a single counter read; an expired read surfaces as a fetch error
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
        }
    }
}

impl RedisConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl QuotaSyncConfig {
    pub async fn load_and_verify_from_path(path: &Path) -> Result<Self, Error> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to read config file `{}`: {e}", path.display()),
            })
        })?;
        let config = Self::from_toml_str(&contents)?;
        tracing::debug!("Loaded config from `{}`", path.display());
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, Error> {
        let config: QuotaSyncConfig = toml::from_str(contents).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config: {e}"),
            })
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.redis.url.is_empty() {
            return Err(config_error("`redis.url` must not be empty"));
        }
        if self.redis.fetch_timeout_ms == 0 {
            return Err(config_error("`redis.fetch_timeout_ms` must be greater than 0"));
        }
        if self.ceilings.anonymous == 0 || self.ceilings.authenticated == 0 {
            return Err(config_error("`ceilings.*` must be positive"));
        }
        validate_table("tables.authenticated", &self.tables.authenticated)?;
        validate_table("tables.anonymous", &self.tables.anonymous)?;
        if self.tables.authenticated.table == self.tables.anonymous.table {
            return Err(config_error(
                "`tables.authenticated` and `tables.anonymous` must name different tables",
            ));
        }
        Ok(())
    }
}

fn validate_table(path: &str, table: &CounterTable) -> Result<(), Error> {
    for (field, value) in [
        ("table", &table.table),
        ("key_column", &table.key_column),
        ("count_column", &table.count_column),
    ] {
        if value.is_empty() {
            return Err(config_error(&format!("`{path}.{field}` must not be empty")));
        }
    }
    Ok(())
}

fn config_error(message: &str) -> Error {
    Error::new(ErrorDetails::Config {
        message: message.to_string(),
    })
}
