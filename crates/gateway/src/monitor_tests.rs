// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::testing::{connect_client, drain, settle, test_gateway};

#[tokio::test]
async fn first_and_last_interest_drive_the_upstream_subscription() {
    let (gateway, remote) = test_gateway();
    let alice = connect_client(&gateway);
    let bob = connect_client(&gateway);

    start_monitor(&gateway, &alice, "motor1").await;
    start_monitor(&gateway, &bob, "motor1").await;
    assert!(lock(&remote.device_monitors).contains("motor1"));
    assert_eq!(lock(&remote.device_monitor_log).len(), 1, "one upstream subscription only");

    stop_monitor(&gateway, &alice, "motor1").await;
    assert!(lock(&remote.device_monitors).contains("motor1"));

    stop_monitor(&gateway, &bob, "motor1").await;
    assert!(!lock(&remote.device_monitors).contains("motor1"));
    assert!(lock(&gateway.monitors).is_empty());
}

#[tokio::test]
async fn client_error_releases_devices_only_it_watched() {
    let (gateway, remote) = test_gateway();
    let alice = connect_client(&gateway);
    let bob = connect_client(&gateway);

    start_monitor(&gateway, &alice, "shared").await;
    start_monitor(&gateway, &bob, "shared").await;
    start_monitor(&gateway, &alice, "private").await;

    gateway.on_client_error(&alice);
    settle().await;

    assert!(lock(&remote.device_monitors).contains("shared"));
    assert!(!lock(&remote.device_monitors).contains("private"));
    assert!(!gateway.visibility_union().contains("private"));
    assert!(gateway.visibility_union().contains("shared"));
}

#[tokio::test]
async fn start_monitor_pushes_a_cached_configuration() {
    let (gateway, remote) = test_gateway();
    lock(&remote.configurations).insert("motor1".to_owned(), json!({"position": 3}));
    let client = connect_client(&gateway);

    start_monitor(&gateway, &client, "motor1").await;

    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "deviceConfigurations");
    assert_eq!(messages[0]["configurations"]["motor1"]["position"], 3);
}

#[tokio::test]
async fn devices_changed_batches_are_restricted_per_client() {
    let (gateway, _remote) = test_gateway();
    let alice = connect_client(&gateway);
    let bob = connect_client(&gateway);
    let carol = connect_client(&gateway);

    lock(&alice.record).visible_instances.insert("d1".to_owned());
    lock(&bob.record).visible_instances.insert("d2".to_owned());

    on_devices_changed(&gateway, &json!({"d1": {"a": 1}, "d2": {"b": 2}}));

    let to_alice = drain(&alice);
    assert_eq!(to_alice.len(), 1, "one message per upstream batch");
    assert_eq!(to_alice[0]["configurations"], json!({"d1": {"a": 1}}));

    let to_bob = drain(&bob);
    assert_eq!(to_bob[0]["configurations"], json!({"d2": {"b": 2}}));

    assert!(drain(&carol).is_empty(), "uninterested clients stay quiet");
}

#[tokio::test]
async fn schema_updates_reach_watchers_and_requesters_once() {
    let (gateway, _remote) = test_gateway();
    let watcher = connect_client(&gateway);
    let requester = connect_client(&gateway);
    let bystander = connect_client(&gateway);

    lock(&watcher.record).visible_instances.insert("d1".to_owned());
    lock(&requester.record).requested_device_schemas.insert("d1".to_owned());

    on_schema_updated(&gateway, "d1", &json!({"rows": 2}));

    assert_eq!(drain(&watcher).len(), 1);
    assert_eq!(drain(&requester).len(), 1);
    assert!(drain(&bystander).is_empty());
    assert!(
        lock(&requester.record).requested_device_schemas.is_empty(),
        "request mark cleared after the answer"
    );
}

#[tokio::test]
async fn class_schemas_answer_pending_requests_only() {
    let (gateway, _remote) = test_gateway();
    let requester = connect_client(&gateway);
    let other = connect_client(&gateway);

    lock(&requester.record)
        .requested_class_schemas
        .entry("srv1".to_owned())
        .or_default()
        .insert("Motor".to_owned());

    on_class_schema(&gateway, "srv1", "Motor", &json!({"schema": true}));

    let messages = drain(&requester);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "classSchema");
    assert_eq!(messages[0]["classId"], "Motor");
    assert!(drain(&other).is_empty());
    assert!(lock(&requester.record).requested_class_schemas.is_empty());
}

#[tokio::test]
async fn empty_class_schema_clears_the_request_without_an_answer() {
    let (gateway, _remote) = test_gateway();
    let requester = connect_client(&gateway);

    lock(&requester.record)
        .requested_class_schemas
        .entry("srv1".to_owned())
        .or_default()
        .insert("Ghost".to_owned());

    on_class_schema(&gateway, "srv1", "Ghost", &serde_json::Value::Null);

    assert!(drain(&requester).is_empty());
    assert!(lock(&requester.record).requested_class_schemas.is_empty());
}
