use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, ErrorDetails};
use crate::identity::Identity;
use crate::store::{CounterTable, CounterTables};

/// Row-level change notifications for a single counter row.
///
/// The stream owns the underlying connection: dropping it unsubscribes. It ends when the
/// remote side closes the subscription.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, target: &SubscriptionTarget) -> Result<ChangeStream, Error>;
}

/// Deterministic name of the subscription for one identity: `<table>_<identityValue>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey(String);

impl SubscriptionKey {
    pub fn new(table: &CounterTable, identity_value: &str) -> Self {
        Self(format!("{}_{identity_value}", table.table))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Equality filter on the key column, `key_column=eq.value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionFilter {
    pub table: String,
    pub column: String,
    pub value: String,
}

impl std::fmt::Display for SubscriptionFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

/// Everything a change feed needs to open one subscription and decode its payloads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub key: SubscriptionKey,
    pub filter: SubscriptionFilter,
    pub count_column: String,
}

impl SubscriptionTarget {
    pub fn for_identity(tables: &CounterTables, identity: &Identity) -> Self {
        let table = tables.for_kind(identity.kind());
        Self {
            key: SubscriptionKey::new(table, identity.value()),
            filter: SubscriptionFilter {
                table: table.table.clone(),
                column: table.key_column.clone(),
                value: identity.value().to_string(),
            },
            count_column: table.count_column.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    /// The count carried by the new row image, if any. Deletes usually carry none.
    pub new_count: Option<u64>,
}

impl ChangeEvent {
    pub fn update(new_count: u64) -> Self {
        Self {
            event_type: ChangeEventType::Update,
            new_count: Some(new_count),
        }
    }
}

/// Wire format of a change notification:
/// `{"event_type": "UPDATE", "new": {"user_id": "u-42", "prompt_count": 4}, "old": {...}}`
#[derive(Debug, Deserialize)]
struct ChangePayload {
    event_type: ChangeEventType,
    #[serde(default)]
    new: Option<Map<String, Value>>,
    #[serde(default)]
    old: Option<Map<String, Value>>,
}

/// Decode a raw payload for `target`.
///
/// Returns `Ok(None)` for rows that do not match the subscription filter.
pub fn parse_change_payload(
    payload: &str,
    target: &SubscriptionTarget,
) -> Result<Option<ChangeEvent>, Error> {
    let payload: ChangePayload = serde_json::from_str(payload).map_err(|e| {
        Error::new(ErrorDetails::Serialization {
            message: format!("invalid payload on `{}`: {e}", target.key),
        })
    })?;

    let row_key = payload
        .new
        .as_ref()
        .and_then(|row| row.get(&target.filter.column))
        .or_else(|| {
            payload
                .old
                .as_ref()
                .and_then(|row| row.get(&target.filter.column))
        });
    if let Some(row_key) = row_key {
        if row_key.as_str() != Some(target.filter.value.as_str()) {
            tracing::debug!(
                "Dropping change on `{}` for a `{}` row outside `{}`",
                target.key,
                target.filter.table,
                target.filter
            );
            return Ok(None);
        }
    }

    let new_count = match payload
        .new
        .as_ref()
        .and_then(|row| row.get(&target.count_column))
    {
        None | Some(Value::Null) => None,
        Some(value) => match value.as_u64() {
            Some(count) => Some(count),
            None => {
                tracing::warn!(
                    "Ignoring non-integer `{}` value {value} on `{}`",
                    target.count_column,
                    target.key
                );
                None
            }
        },
    };

    Ok(Some(ChangeEvent {
        event_type: payload.event_type,
        new_count,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn guest_target() -> SubscriptionTarget {
        SubscriptionTarget::for_identity(
            &CounterTables::default(),
            &Identity::Anonymous {
                fingerprint: "fp-123".to_string(),
            },
        )
    }

    #[test]
    fn test_subscription_key_and_filter() {
        let target = SubscriptionTarget::for_identity(
            &CounterTables::default(),
            &Identity::Authenticated {
                account_id: "u-42".to_string(),
                session_valid: true,
            },
        );
        assert_eq!(target.key.as_str(), "user_stats_u-42");
        assert_eq!(target.filter.to_string(), "user_id=eq.u-42");
        assert_eq!(target.filter.table, "user_stats");
        assert_eq!(target.count_column, "prompt_count");

        let target = guest_target();
        assert_eq!(target.key.as_str(), "guest_tracking_fp-123");
        assert_eq!(target.filter.to_string(), "fingerprint_id=eq.fp-123");
    }

    #[test]
    fn test_parse_update() {
        let event = parse_change_payload(
            r#"{"event_type":"UPDATE","new":{"fingerprint_id":"fp-123","prompt_count":4}}"#,
            &guest_target(),
        )
        .unwrap();
        assert_eq!(event, Some(ChangeEvent::update(4)));
    }

    #[test]
    fn test_parse_delete_has_no_count() {
        let event = parse_change_payload(
            r#"{"event_type":"DELETE","new":{},"old":{"fingerprint_id":"fp-123"}}"#,
            &guest_target(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.event_type, ChangeEventType::Delete);
        assert_eq!(event.new_count, None);
    }

    #[test]
    #[traced_test]
    fn test_parse_drops_other_rows() {
        let event = parse_change_payload(
            r#"{"event_type":"INSERT","new":{"fingerprint_id":"fp-999","prompt_count":1}}"#,
            &guest_target(),
        )
        .unwrap();
        assert_eq!(event, None);
        assert!(logs_contain(
            "for a `guest_tracking` row outside `fingerprint_id=eq.fp-123`"
        ));
    }

    #[test]
    fn test_parse_ignores_negative_count() {
        let event = parse_change_payload(
            r#"{"event_type":"UPDATE","new":{"prompt_count":-3}}"#,
            &guest_target(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.new_count, None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = parse_change_payload("not json", &guest_target()).unwrap_err();
        assert!(matches!(
            err.get_details(),
            ErrorDetails::Serialization { .. }
        ));
    }
}
