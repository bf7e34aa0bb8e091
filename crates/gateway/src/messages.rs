// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Outbound wire-message constructors and inbound field helpers.
//!
//! Every message exchanged with a client is a JSON object carrying a `type`
//! discriminator. Inbound messages stay untyped (`serde_json::Value`) and are
//! picked apart with the helpers below; outbound messages are built here so
//! the wire vocabulary lives in one place.

use serde_json::{json, Map, Value};

use crate::config::GatewayConfig;

/// Human-readable server-local notice.
pub fn notification(message: impl Into<String>) -> Value {
    json!({ "type": "notification", "message": message.into() })
}

/// Pre-login banner describing this gateway.
pub fn broker_information(config: &GatewayConfig) -> Value {
    json!({
        "type": "brokerInformation",
        "topic": config.subject_prefix,
        "hostname": config.host,
        "hostport": config.port,
        "deviceId": config.gateway_id,
        "readOnly": config.read_only,
        "version": env!("CARGO_PKG_VERSION"),
    })
}

/// Full topology snapshot, sent once after login.
pub fn system_topology(topology: Value) -> Value {
    json!({ "type": "systemTopology", "systemTopology": topology })
}

/// One throttler batch of instance changes.
pub fn topology_update(changes: Value) -> Value {
    json!({ "type": "topologyUpdate", "changes": changes })
}

/// Batched per-device configuration deltas.
pub fn device_configurations(configurations: Map<String, Value>) -> Value {
    json!({ "type": "deviceConfigurations", "configurations": configurations })
}

/// Configuration deltas for a single device.
pub fn single_device_configuration(device_id: &str, configuration: Value) -> Value {
    let mut configurations = Map::new();
    configurations.insert(device_id.to_owned(), configuration);
    device_configurations(configurations)
}

pub fn device_schema(device_id: &str, schema: Value) -> Value {
    json!({ "type": "deviceSchema", "deviceId": device_id, "schema": schema })
}

pub fn class_schema(server_id: &str, class_id: &str, schema: Value) -> Value {
    json!({
        "type": "classSchema",
        "serverId": server_id,
        "classId": class_id,
        "schema": schema,
    })
}

/// Streaming pipeline item for one producer channel.
pub fn network_data(channel_name: &str, data: Value, timestamp: f64) -> Value {
    json!({
        "type": "networkData",
        "name": channel_name,
        "data": data,
        "meta": { "timestamp": timestamp },
    })
}

/// One batch of forwarded log records.
pub fn log_batch(messages: Vec<Value>) -> Value {
    json!({ "type": "log", "messages": messages })
}

/// Broadcast project-manager change notice.
pub fn project_update(info: Value) -> Value {
    json!({ "type": "projectUpdate", "info": info })
}

// -- Inbound helpers ----------------------------------------------------------

/// The `type` discriminator of an inbound message.
pub fn msg_type(msg: &Value) -> Option<&str> {
    msg.get("type").and_then(Value::as_str)
}

pub fn str_field<'a>(msg: &'a Value, key: &str) -> Option<&'a str> {
    msg.get(key).and_then(Value::as_str)
}

pub fn bool_field(msg: &Value, key: &str) -> Option<bool> {
    msg.get(key).and_then(Value::as_bool)
}

pub fn i64_field(msg: &Value, key: &str) -> Option<i64> {
    msg.get(key).and_then(Value::as_i64)
}
