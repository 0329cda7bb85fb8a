use std::time::Duration;

use quota_sync_internal::identity::IdentityInput;
use serde_json::json;

use crate::common::{
    connection, make_tracker, publish_update, unique, wait_for_subscribers, write_row,
};

#[tokio::test]
async fn test_account_count_follows_published_updates() {
    let mut conn = connection().await;
    let account_id = unique("u");
    write_row(&mut conn, "user_stats", "user_id", &account_id, 3).await;

    let tracker = make_tracker().await;
    let mut receiver = tracker.subscribe();
    tracker
        .set_identity(IdentityInput::authenticated(account_id.clone()))
        .await;

    let state = tracker.state();
    assert_eq!(state.prompt_count, 3);
    assert_eq!(state.max_prompts, 8);
    assert!(!state.loading);
    assert!(state.error.is_none());

    let channel = format!("user_stats_{account_id}");
    // A row for someone else on the same channel is ignored
    publish_update(
        &mut conn,
        &channel,
        json!({ "user_id": "someone-else", "prompt_count": 99 }),
    )
    .await;
    publish_update(
        &mut conn,
        &channel,
        json!({ "user_id": account_id, "prompt_count": 4 }),
    )
    .await;

    let state = tokio::time::timeout(
        Duration::from_secs(5),
        receiver.wait_for(|s| s.prompt_count != 3),
    )
    .await
    .unwrap()
    .unwrap()
    .clone();
    assert_eq!(state.prompt_count, 4);

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_guest_without_row() {
    let tracker = make_tracker().await;
    let fingerprint = unique("fp");

    tracker
        .set_identity(IdentityInput::anonymous(fingerprint.clone()))
        .await;

    let state = tracker.state();
    assert_eq!(state.prompt_count, 0);
    assert_eq!(state.max_prompts, 5);
    assert!(!state.loading);
    assert_eq!(
        tracker.active_subscription().await.unwrap().to_string(),
        format!("guest_tracking_{fingerprint}")
    );

    tracker.shutdown().await;
}

#[tokio::test]
async fn test_switching_identity_moves_the_subscription() {
    let mut conn = connection().await;
    let fingerprint = unique("fp");
    let account_id = unique("u");
    let guest_channel = format!("guest_tracking_{fingerprint}");
    let account_channel = format!("user_stats_{account_id}");

    let tracker = make_tracker().await;
    tracker
        .set_identity(IdentityInput::anonymous(fingerprint.clone()))
        .await;
    wait_for_subscribers(&mut conn, &guest_channel, 1).await;

    tracker
        .set_identity(IdentityInput::authenticated(account_id).with_fingerprint(fingerprint))
        .await;
    wait_for_subscribers(&mut conn, &guest_channel, 0).await;
    wait_for_subscribers(&mut conn, &account_channel, 1).await;

    tracker.shutdown().await;
    wait_for_subscribers(&mut conn, &account_channel, 0).await;
}
