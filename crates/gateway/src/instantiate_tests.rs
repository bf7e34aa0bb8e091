// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::time::Duration;

use serde_json::json;

use super::*;
use crate::remote::RemoteError;
use crate::testing::{connect_client, drain, settle, test_gateway};

fn init_msg(device_id: &str) -> serde_json::Value {
    json!({
        "type": "initDevice",
        "serverId": "srv1",
        "deviceId": device_id,
        "configuration": {},
    })
}

#[tokio::test(start_paused = true)]
async fn the_pump_services_one_request_per_tick() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);

    on_init_device(&gateway, &client, init_msg("d1"));
    on_init_device(&gateway, &client, init_msg("d2"));
    spawn_instantiation_pump(std::sync::Arc::clone(&gateway));

    // The first tick fires immediately and services exactly one request.
    settle().await;
    assert_eq!(remote.request_count(), 1);

    tokio::time::sleep(gateway.config.wait_init_device() + Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(remote.request_count(), 2);

    let requests = lock(&remote.requests);
    assert!(requests.iter().all(|r| r.slot == "slotStartDevice" && r.instance_id == "srv1"));
}

#[tokio::test(start_paused = true)]
async fn init_replies_reach_the_originating_client() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    remote.push_response(Ok(json!({"success": true, "message": "started"})));

    on_init_device(&gateway, &client, init_msg("d1"));
    spawn_instantiation_pump(std::sync::Arc::clone(&gateway));
    settle().await;

    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "initReply");
    assert_eq!(messages[0]["deviceId"], "d1");
    assert_eq!(messages[0]["success"], true);
    assert_eq!(messages[0]["message"], "started");
}

#[tokio::test(start_paused = true)]
async fn a_failed_start_reports_the_failure_and_drops_pending_updates() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    remote.push_response(Err(RemoteError::Remote("no plugin".to_owned())));

    let mut msg = init_msg("d1");
    msg["schemaUpdates"] = json!([{"path": "limit", "value": 5}]);
    on_init_device(&gateway, &client, msg);
    assert!(lock(&gateway.pending_attributes).contains_key("d1"));

    spawn_instantiation_pump(std::sync::Arc::clone(&gateway));
    settle().await;

    let messages = drain(&client);
    assert_eq!(messages[0]["success"], false);
    assert!(messages[0]["message"].as_str().unwrap_or_default().contains("no plugin"));
    assert!(
        !lock(&gateway.pending_attributes).contains_key("d1"),
        "failure resets the pending machine"
    );
}

#[tokio::test(start_paused = true)]
async fn an_upstream_error_stops_the_pump() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    remote.push_response(Err(RemoteError::Remote("broker unreachable".to_owned())));

    on_init_device(&gateway, &client, init_msg("d1"));
    on_init_device(&gateway, &client, init_msg("d2"));
    spawn_instantiation_pump(std::sync::Arc::clone(&gateway));
    settle().await;
    assert_eq!(remote.request_count(), 1);

    // The failed request reached the client, but the timer did not re-arm:
    // the second instantiation is never serviced.
    tokio::time::sleep(gateway.config.wait_init_device() * 3).await;
    settle().await;
    assert_eq!(remote.request_count(), 1);
    assert_eq!(lock(&gateway.pending_instantiations).len(), 1);

    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["success"], false);
}

#[tokio::test]
async fn attribute_updates_fire_only_after_both_events() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);

    let mut msg = init_msg("d1");
    msg["schemaUpdates"] = json!([{"path": "limit", "value": 5}]);
    on_init_device(&gateway, &client, msg);

    attribute_event(&gateway, "d1", AttributeEvent::InstanceNew).await;
    assert_eq!(remote.request_count(), 0, "one event is not enough");

    attribute_event(&gateway, "d1", AttributeEvent::ServerReply).await;
    let requests = lock(&remote.requests);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].slot, "slotUpdateSchemaAttributes");
    assert_eq!(requests[0].instance_id, "d1");
    drop(requests);
    assert!(lock(&gateway.pending_attributes).is_empty());
}

#[tokio::test]
async fn event_order_does_not_matter() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);

    let mut msg = init_msg("d1");
    msg["schemaUpdates"] = json!([{"path": "limit", "value": 5}]);
    on_init_device(&gateway, &client, msg);

    attribute_event(&gateway, "d1", AttributeEvent::ServerReply).await;
    assert_eq!(remote.request_count(), 0);
    attribute_event(&gateway, "d1", AttributeEvent::InstanceNew).await;
    assert_eq!(remote.request_count(), 1);
}

#[tokio::test]
async fn instance_gone_resets_the_machine() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);

    let mut msg = init_msg("d1");
    msg["schemaUpdates"] = json!([{"path": "limit", "value": 5}]);
    on_init_device(&gateway, &client, msg);

    attribute_event(&gateway, "d1", AttributeEvent::InstanceNew).await;
    attribute_event(&gateway, "d1", AttributeEvent::InstanceGone).await;
    attribute_event(&gateway, "d1", AttributeEvent::ServerReply).await;

    assert_eq!(remote.request_count(), 0, "gone discarded the pending updates");
    assert!(lock(&gateway.pending_attributes).is_empty());
}

#[tokio::test]
async fn requests_without_updates_never_touch_the_machine() {
    let (gateway, _remote) = test_gateway();
    let client = connect_client(&gateway);

    on_init_device(&gateway, &client, init_msg("d1"));
    assert!(lock(&gateway.pending_attributes).is_empty());
}
