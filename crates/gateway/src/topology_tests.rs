// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;
use crate::remote::RemoteEvent;
use crate::testing::{connect_client, drain, settle, test_config, test_gateway, test_gateway_with};

#[tokio::test]
async fn instance_changes_flow_through_the_throttler_to_all_clients() {
    let (gateway, _remote) = test_gateway();
    let client = connect_client(&gateway);

    handle_event(
        &gateway,
        RemoteEvent::InstanceNew {
            instance_id: "d1".to_owned(),
            instance_type: "device".to_owned(),
            info: json!({"classId": "Motor"}),
        },
    )
    .await;
    assert!(drain(&client).is_empty(), "changes are held for the cycle");

    gateway.flush_topology_changes();
    let messages = drain(&client);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["type"], "topologyUpdate");
    assert_eq!(messages[0]["changes"]["new"]["device"]["d1"]["classId"], "Motor");
}

#[tokio::test]
async fn alarm_updates_flush_pending_topology_first() {
    let (gateway, _remote) = test_gateway();
    let client = connect_client(&gateway);

    handle_event(
        &gateway,
        RemoteEvent::InstanceNew {
            instance_id: "alarmed".to_owned(),
            instance_type: "device".to_owned(),
            info: json!({}),
        },
    )
    .await;
    handle_event(
        &gateway,
        RemoteEvent::AlarmUpdate {
            instance_id: "alarmsvc".to_owned(),
            update_type: "alarmUpdate".to_owned(),
            rows: json!({"r1": {"device": "alarmed"}}),
        },
    )
    .await;

    let messages = drain(&client);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["type"], "topologyUpdate", "instance precedes its alarm row");
    assert_eq!(messages[1]["type"], "alarmUpdate");
}

#[tokio::test]
async fn new_devices_of_ignored_classes_join_the_timeout_exemption() {
    let mut config = test_config();
    config.ignore_timeout_classes = vec!["Macro".to_owned()];
    let (gateway, _remote) = test_gateway_with(config);

    handle_event(
        &gateway,
        RemoteEvent::InstanceNew {
            instance_id: "macro1".to_owned(),
            instance_type: "device".to_owned(),
            info: json!({"classId": "Macro"}),
        },
    )
    .await;

    assert!(gateway.is_timing_out("macro1"));
}

#[tokio::test]
async fn returning_devices_reconnect_their_monitor() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    crate::monitor::start_monitor(&gateway, &client, "d1").await;

    // The device bounced: its subscription upstream was lost.
    lock(&remote.device_monitors).clear();

    handle_event(
        &gateway,
        RemoteEvent::InstanceNew {
            instance_id: "d1".to_owned(),
            instance_type: "device".to_owned(),
            info: json!({"classId": "Motor"}),
        },
    )
    .await;

    assert!(lock(&remote.device_monitors).contains("d1"));
}

#[tokio::test]
async fn a_gone_instance_is_scrubbed_from_every_table() {
    let (gateway, remote) = test_gateway();
    let client = connect_client(&gateway);
    crate::monitor::start_monitor(&gateway, &client, "d1").await;
    crate::pipeline::subscribe(&gateway, &client, "d1:output").await;
    crate::project::register_manager(&gateway, "d1");
    lock(&gateway.timing_out_devices).insert("d1".to_owned());
    lock(&client.record).requested_device_schemas.insert("d1".to_owned());
    drain(&client);

    handle_event(
        &gateway,
        RemoteEvent::InstanceGone {
            instance_id: "d1".to_owned(),
            instance_type: "device".to_owned(),
            info: json!({}),
        },
    )
    .await;
    settle().await;

    let record = lock(&client.record);
    assert!(!record.visible_instances.contains("d1"));
    assert!(!record.requested_device_schemas.contains("d1"));
    drop(record);
    assert!(!lock(&gateway.monitors).contains_key("d1"));
    assert!(!lock(&remote.device_monitors).contains("d1"));
    assert!(!lock(&gateway.pipelines).contains_key("d1:output"));
    assert!(!lock(&remote.pipeline_monitors).contains("d1:output"));
    assert!(crate::project::known_managers(&gateway).is_empty());
    assert!(!gateway.is_timing_out("d1"));
}

#[tokio::test]
async fn bootstrap_discovers_managers_and_requests_the_logger_map() {
    let (gateway, remote) = test_gateway();
    *lock(&remote.topology) = json!({
        "device": {
            "pm1": {"classId": "ProjectManager"},
            "alarms": {"classId": "AlarmService"},
            "motor1": {"classId": "Motor"},
        }
    });

    bootstrap(&gateway).await;
    settle().await;

    assert_eq!(crate::project::known_managers(&gateway), vec!["pm1".to_owned()]);
    let calls = lock(&remote.calls);
    assert!(calls
        .iter()
        .any(|(id, slot, _)| id == &gateway.config.data_log_manager_id && slot == "slotGetLoggerMap"));
    drop(calls);
    let requests = lock(&remote.requests);
    assert!(requests.iter().any(|r| r.instance_id == "alarms" && r.slot == "slotRequestAlarmDump"));
}

#[tokio::test]
async fn recalculation_can_rebuild_the_exemption_set_from_scratch() {
    let mut config = test_config();
    config.ignore_timeout_classes = vec!["Macro".to_owned()];
    let (gateway, _remote) = test_gateway_with(config);
    lock(&gateway.timing_out_devices).insert("stale".to_owned());

    let topology = json!({
        "device": {
            "macro1": {"classId": "Macro"},
            "motor1": {"classId": "Motor"},
        }
    });
    recalculate_timing_out(&gateway, &topology, true);

    assert!(gateway.is_timing_out("macro1"));
    assert!(!gateway.is_timing_out("motor1"));
    assert!(!gateway.is_timing_out("stale"));
}

#[tokio::test]
async fn log_events_land_in_the_forwarding_cache() {
    let (gateway, _remote) = test_gateway();
    handle_event(
        &gateway,
        RemoteEvent::LogMessages { messages: vec![json!({"type": "ERROR", "message": "boom"})] },
    )
    .await;
    assert_eq!(lock(&gateway.log_cache).len(), 1);
}
