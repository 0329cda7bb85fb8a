//! Redis-backed counter store and change feed.
//!
//! Each counter row lives under `<table>:<key>` as a JSON object, e.g.
//! `user_stats:u-42 -> {"user_id": "u-42", "prompt_count": 7}`. Whoever writes a row also
//! publishes a change payload (see `crate::feed::parse_change_payload`) on the row's
//! subscription channel, `<table>_<key>`.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::instrument;

use crate::error::{Error, ErrorDetails};
use crate::feed::{parse_change_payload, ChangeFeed, ChangeStream, SubscriptionTarget};
use crate::store::{CounterStore, CounterTable};

pub struct RedisClient {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisClient {
    pub async fn new(url: &str) -> Result<Self, Error> {
        let (client, conn) = Self::init_conn(url).await?;
        Ok(Self { client, conn })
    }

    async fn init_conn(url: &str) -> Result<(redis::Client, MultiplexedConnection), Error> {
        let client = redis::Client::open(url).map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to create Redis client: {e}"),
            })
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Failed to get Redis connection: {e}"),
                })
            })?;

        Ok((client, conn))
    }
}

/// Redis key holding the row for `key` in `table`
pub fn row_key(table: &CounterTable, key: &str) -> String {
    format!("{}:{key}", table.table)
}

/// Pull the count column out of a stored row. A row without a count has used nothing yet.
fn parse_row(json: &str, table: &CounterTable, key: &str) -> Result<u64, Error> {
    let invalid = |message: String| {
        Error::new(ErrorDetails::InvalidRow {
            table: table.table.clone(),
            key: key.to_string(),
            message,
        })
    };

    let row: Value =
        serde_json::from_str(json).map_err(|e| invalid(format!("row is not valid JSON: {e}")))?;
    let Value::Object(row) = row else {
        return Err(invalid("expected a JSON object".to_string()));
    };

    match row.get(&table.count_column) {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value.as_u64().ok_or_else(|| {
            invalid(format!(
                "`{}` is not a non-negative integer: {value}",
                table.count_column
            ))
        }),
    }
}

#[async_trait]
impl CounterStore for RedisClient {
    #[instrument(skip(self, table), fields(table = %table.table))]
    async fn read_count(&self, table: &CounterTable, key: &str) -> Result<Option<u64>, Error> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(row_key(table, key)).await.map_err(|e| {
            Error::new(ErrorDetails::Fetch {
                table: table.table.clone(),
                message: e.to_string(),
            })
        })?;

        raw.map(|json| parse_row(&json, table, key)).transpose()
    }
}

#[async_trait]
impl ChangeFeed for RedisClient {
    async fn subscribe(&self, target: &SubscriptionTarget) -> Result<ChangeStream, Error> {
        let subscription_error = |message: String| {
            Error::new(ErrorDetails::Subscription {
                channel: target.key.to_string(),
                message,
            })
        };

        // One pubsub connection per subscription, so dropping the stream unsubscribes
        let mut pubsub_conn = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| subscription_error(format!("Failed to connect to redis: {e}")))?;
        pubsub_conn
            .subscribe(target.key.as_str())
            .await
            .map_err(|e| subscription_error(format!("Failed to subscribe to redis: {e}")))?;

        let target = target.clone();
        let stream = pubsub_conn.into_on_message().filter_map(move |msg| {
            let event = match msg.get_payload::<String>() {
                // Decode errors are logged when they are constructed
                Ok(payload) => parse_change_payload(&payload, &target).ok().flatten(),
                Err(e) => {
                    tracing::error!("Failed to decode redis message on `{}`: {e}", target.key);
                    None
                }
            };
            futures::future::ready(event)
        });

        Ok(stream.boxed())
    }
}
