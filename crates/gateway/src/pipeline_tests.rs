// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::testing::{connect_client, drain, settle, test_gateway};

#[tokio::test]
async fn readiness_gates_every_delivery() {
    let (gateway, _remote) = test_gateway();
    let client = connect_client(&gateway);
    subscribe(&gateway, &client, "cam1:output").await;

    // Freshly subscribed clients are ready: the first item arrives.
    on_data(&gateway, "cam1:output", json!({"frame": 1}), 1.0);
    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "networkData");
    assert_eq!(messages[0]["name"], "cam1:output");
    assert_eq!(messages[0]["data"]["frame"], 1);

    // Not re-armed: the second item is skipped, not queued.
    on_data(&gateway, "cam1:output", json!({"frame": 2}), 2.0);
    assert!(drain(&client).is_empty());

    // Re-armed: the next item arrives.
    request_more(&gateway, &client, "cam1:output");
    on_data(&gateway, "cam1:output", json!({"frame": 3}), 3.0);
    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["data"]["frame"], 3);
}

#[tokio::test]
async fn upstream_subscription_follows_first_and_last_subscriber() {
    let (gateway, remote) = test_gateway();
    let alice = connect_client(&gateway);
    let bob = connect_client(&gateway);

    subscribe(&gateway, &alice, "cam1:output").await;
    assert!(lock(&remote.pipeline_monitors).contains("cam1:output"));

    subscribe(&gateway, &bob, "cam1:output").await;
    unsubscribe(&gateway, &alice, "cam1:output").await;
    assert!(lock(&remote.pipeline_monitors).contains("cam1:output"));

    unsubscribe(&gateway, &bob, "cam1:output").await;
    assert!(!lock(&remote.pipeline_monitors).contains("cam1:output"));
    assert!(lock(&gateway.pipelines).is_empty());
}

#[tokio::test]
async fn duplicate_subscriptions_are_ignored() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);

    subscribe(&gateway, &client, "cam1:output").await;
    subscribe(&gateway, &client, "cam1:output").await;

    let pipelines = lock(&gateway.pipelines);
    let subscribers = pipelines.get("cam1:output").map(|s| s.len());
    assert_eq!(subscribers, Some(1));
    drop(pipelines);
    assert!(lock(&remote.pipeline_monitors).contains("cam1:output"));
}

#[tokio::test]
async fn ready_subscribers_receive_while_stalled_ones_skip() {
    let (gateway, _remote) = test_gateway();
    let fast = connect_client(&gateway);
    let slow = connect_client(&gateway);
    subscribe(&gateway, &fast, "cam1:output").await;
    subscribe(&gateway, &slow, "cam1:output").await;

    on_data(&gateway, "cam1:output", json!({"frame": 1}), 1.0);
    assert_eq!(drain(&fast).len(), 1);
    assert_eq!(drain(&slow).len(), 1);

    request_more(&gateway, &fast, "cam1:output");
    on_data(&gateway, "cam1:output", json!({"frame": 2}), 2.0);
    assert_eq!(drain(&fast).len(), 1);
    assert!(drain(&slow).is_empty(), "stalled client skips the item");
}

#[tokio::test]
async fn client_error_releases_orphaned_pipelines() {
    let (gateway, remote) = test_gateway();
    let alice = connect_client(&gateway);
    let bob = connect_client(&gateway);
    subscribe(&gateway, &alice, "cam1:output").await;
    subscribe(&gateway, &bob, "cam1:output").await;
    subscribe(&gateway, &alice, "cam2:output").await;

    gateway.on_client_error(&alice);
    settle().await;

    assert!(lock(&remote.pipeline_monitors).contains("cam1:output"));
    assert!(!lock(&remote.pipeline_monitors).contains("cam2:output"));
}

#[tokio::test]
async fn producer_gone_drops_its_channels() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    subscribe(&gateway, &client, "cam1:output").await;
    subscribe(&gateway, &client, "cam2:output").await;

    drop_producer(&gateway, "cam1").await;

    assert!(!lock(&remote.pipeline_monitors).contains("cam1:output"));
    assert!(lock(&remote.pipeline_monitors).contains("cam2:output"));
    assert!(!lock(&gateway.pipelines).contains_key("cam1:output"));
}

#[tokio::test]
async fn data_for_an_unknown_channel_is_discarded() {
    let (gateway, _remote) = test_gateway();
    let client = connect_client(&gateway);

    on_data(&gateway, "nobody:cares", json!({}), 0.0);
    assert!(drain(&client).is_empty());
}
