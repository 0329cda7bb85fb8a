use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use quota_sync_internal::config_parser::{QuotaSyncConfig, RedisConfig};
use quota_sync_internal::observability::TracingObserver;
use quota_sync_internal::quota::QuotaTracker;
use quota_sync_internal::redis_client::RedisClient;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::json;

pub fn redis_url() -> String {
    std::env::var("QUOTA_SYNC_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

/// Suffix that keeps rows and channels from concurrent test runs apart
pub fn unique(prefix: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{prefix}-{}-{nanos}", std::process::id())
}

pub async fn connection() -> MultiplexedConnection {
    redis::Client::open(redis_url())
        .unwrap()
        .get_multiplexed_async_connection()
        .await
        .unwrap()
}

pub async fn make_tracker() -> QuotaTracker {
    let config = QuotaSyncConfig {
        redis: RedisConfig {
            url: redis_url(),
            ..Default::default()
        },
        ..Default::default()
    };
    let client = Arc::new(RedisClient::new(&config.redis.url).await.unwrap());
    QuotaTracker::from_config(&config, client.clone(), client, Arc::new(TracingObserver))
}

pub async fn write_row(
    conn: &mut MultiplexedConnection,
    table: &str,
    key_column: &str,
    key: &str,
    count: u64,
) {
    let mut row = serde_json::Map::new();
    row.insert(key_column.to_string(), json!(key));
    row.insert("prompt_count".to_string(), json!(count));
    let row = serde_json::Value::Object(row);
    let _: () = conn
        .set_ex(format!("{table}:{key}"), row.to_string(), 60)
        .await
        .unwrap();
}

pub async fn publish_update(
    conn: &mut MultiplexedConnection,
    channel: &str,
    new_row: serde_json::Value,
) {
    let payload = json!({ "event_type": "UPDATE", "new": new_row });
    let _: () = conn.publish(channel, payload.to_string()).await.unwrap();
}

/// Number of clients subscribed to `channel`, polled until it reaches `expected`
pub async fn wait_for_subscribers(conn: &mut MultiplexedConnection, channel: &str, expected: i64) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let (_, count): (String, i64) = redis::cmd("PUBSUB")
                .arg("NUMSUB")
                .arg(channel)
                .query_async(&mut *conn)
                .await
                .unwrap();
            if count == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "`{channel}` never reached {expected} subscribers");
}
