// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Fabric event pump and topology bookkeeping.
//!
//! All fabric-originated traffic funnels through [`spawn_event_pump`]:
//! topology changes feed the throttler (and their side effects run
//! immediately), device updates fan out through the monitor, pipeline data
//! goes through the readiness gate, logs into the forwarding cache. Alarm
//! messages flush pending topology changes first so a client never sees an
//! alarm row for an instance it has not been told about.

use std::sync::Arc;

use serde_json::Value;

use crate::history;
use crate::instantiate::{self, AttributeEvent};
use crate::logfwd;
use crate::messages;
use crate::monitor;
use crate::pipeline;
use crate::project;
use crate::queue::Priority;
use crate::remote::RemoteEvent;
use crate::router;
use crate::state::{lock, Gateway};

pub fn spawn_event_pump(gateway: Arc<Gateway>) {
    let mut events = gateway.remote.subscribe_events();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = gateway.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => handle_event(&gateway, event).await,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "fabric event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });
}

async fn handle_event(gateway: &Arc<Gateway>, event: RemoteEvent) {
    match event {
        RemoteEvent::InstanceNew { instance_id, instance_type, info } => {
            instance_new(gateway, &instance_id, &instance_type, &info).await;
            if let Some(throttler) = gateway.throttler() {
                throttler.submit_new(&instance_id, &instance_type, info);
            }
        }
        RemoteEvent::InstanceUpdated { instance_id, instance_type, info } => {
            if let Some(throttler) = gateway.throttler() {
                throttler.submit_update(&instance_id, &instance_type, info);
            }
        }
        RemoteEvent::InstanceGone { instance_id, instance_type, info } => {
            instance_gone(gateway, &instance_id).await;
            if let Some(throttler) = gateway.throttler() {
                throttler.submit_gone(&instance_id, &instance_type, info);
            }
        }
        RemoteEvent::DevicesChanged { updates } => monitor::on_devices_changed(gateway, &updates),
        RemoteEvent::SchemaUpdated { device_id, schema } => {
            monitor::on_schema_updated(gateway, &device_id, &schema);
        }
        RemoteEvent::ClassSchema { server_id, class_id, schema } => {
            monitor::on_class_schema(gateway, &server_id, &class_id, &schema);
        }
        RemoteEvent::LoggerMap { map } => history::update_logger_map(gateway, &map),
        RemoteEvent::PipelineData { channel_name, data, timestamp } => {
            pipeline::on_data(gateway, &channel_name, data, timestamp);
        }
        RemoteEvent::AlarmUpdate { instance_id, update_type, rows } => {
            // Clients must observe the instance before any alarm row that
            // refers to it.
            gateway.flush_topology_changes();
            gateway.broadcast(
                serde_json::json!({
                    "type": update_type,
                    "instanceId": instance_id,
                    "rows": rows,
                }),
                Priority::Lossless,
            );
        }
        RemoteEvent::ProjectUpdate { info } => {
            gateway.broadcast(messages::project_update(info), Priority::Lossless);
        }
        RemoteEvent::LogMessages { messages } => logfwd::ingest(gateway, messages),
    }
}

/// Side effects of a device appearing, beyond the throttled client update.
async fn instance_new(gateway: &Arc<Gateway>, instance_id: &str, instance_type: &str, info: &Value) {
    if instance_type != "device" {
        return;
    }
    let class_id = messages::str_field(info, "classId").unwrap_or_default();

    if gateway.config.ignore_timeout_classes.iter().any(|ignored| ignored == class_id) {
        lock(&gateway.timing_out_devices).insert(instance_id.to_owned());
    }

    // A client noted interest while the device was down; reconnect the
    // monitor now that it is back.
    let wanted = lock(&gateway.monitors).contains_key(instance_id);
    if wanted {
        tracing::debug!(instance_id, "reconnecting monitor for returning device");
        gateway.remote.register_device_monitor(instance_id).await;
    }

    if instance_id == gateway.config.data_log_manager_id {
        if let Err(e) =
            gateway.remote.call(instance_id, "slotGetLoggerMap", serde_json::json!({})).await
        {
            tracing::warn!(err = %e, "logger map refresh failed");
        }
    }

    instantiate::attribute_event(gateway, instance_id, AttributeEvent::InstanceNew).await;

    match class_id {
        "ProjectManager" => project::register_manager(gateway, instance_id),
        "AlarmService" => {
            // Previously unknown alarm service: ask it to seed all clients.
            router::request_alarm_dump(gateway, instance_id.to_owned(), None);
        }
        _ => {}
    }
}

/// Scrub a vanished instance out of every table.
async fn instance_gone(gateway: &Arc<Gateway>, instance_id: &str) {
    gateway.for_each_client(|client| {
        let mut record = lock(&client.record);
        record.visible_instances.remove(instance_id);
        record.requested_device_schemas.remove(instance_id);
        record.requested_class_schemas.remove(instance_id);
    });

    let monitored = lock(&gateway.monitors).remove(instance_id).is_some();
    if monitored {
        gateway.remote.unregister_device_monitor(instance_id).await;
    }

    pipeline::drop_producer(gateway, instance_id).await;
    project::remove_manager(gateway, instance_id);
    lock(&gateway.timing_out_devices).remove(instance_id);

    instantiate::attribute_event(gateway, instance_id, AttributeEvent::InstanceGone).await;
}

/// Walk the initial topology snapshot for devices that need wiring up before
/// any instance-new event arrives: ignore-timeout classes, project managers,
/// alarm services, and the logger map.
pub async fn bootstrap(gateway: &Arc<Gateway>) {
    let topology = gateway.remote.system_topology().await;
    recalculate_timing_out(gateway, &topology, false);

    if let Some(devices) = topology.get("device").and_then(Value::as_object) {
        for (device_id, info) in devices {
            match messages::str_field(info, "classId").unwrap_or_default() {
                "ProjectManager" => project::register_manager(gateway, device_id),
                "AlarmService" => {
                    router::request_alarm_dump(gateway, device_id.clone(), None);
                }
                _ => {}
            }
        }
    }

    let manager_id = gateway.config.data_log_manager_id.clone();
    if let Err(e) = gateway.remote.call(&manager_id, "slotGetLoggerMap", serde_json::json!({})).await
    {
        tracing::debug!(err = %e, "initial logger map request failed");
    }
}

/// Rebuild (or extend) the set of devices whose slot timeouts are ignored.
pub fn recalculate_timing_out(gateway: &Gateway, topology: &Value, clear: bool) {
    let mut timing_out = lock(&gateway.timing_out_devices);
    if clear {
        timing_out.clear();
    }
    let Some(devices) = topology.get("device").and_then(Value::as_object) else {
        return;
    };
    for (device_id, info) in devices {
        let class_id = messages::str_field(info, "classId").unwrap_or_default();
        if gateway.config.ignore_timeout_classes.iter().any(|ignored| ignored == class_id) {
            timing_out.insert(device_id.clone());
        }
    }
}

#[cfg(test)]
#[path = "topology_tests.rs"]
mod tests;
