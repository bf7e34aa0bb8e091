// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Historic data access: property history and configuration-from-past,
//! answered by the data-log readers.
//!
//! The reader serving a device is resolved through the logger map published
//! by the data-log manager, spreading load over the reader replicas
//! round-robin. Requests without a known logger are refused at the boundary.
//! Readers may traverse large time ranges, so these requests run with long
//! timeouts and their replies travel on the drop-oldest lane.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::messages;
use crate::queue::Priority;
use crate::router::refuse_decode;
use crate::state::{lock, ClientHandle, Gateway};

pub const LOGGER_PREFIX: &str = "DataLogger-";
pub const READER_PREFIX: &str = "DataLogReader";
pub const READERS_PER_SERVER: usize = 2;

/// Reading a past configuration can mean replaying every update since the
/// logger last started before the requested point in time.
const CONFIG_FROM_PAST_TIMEOUT: Duration = Duration::from_secs(120);

/// Replace the logger map with a fresh copy from the fabric.
pub fn update_logger_map(gateway: &Gateway, map: &Value) {
    let Some(map) = map.as_object() else {
        return;
    };
    let mut logger_map = lock(&gateway.logger_map);
    logger_map.clear();
    for (logger_id, reader_server) in map {
        if let Some(reader_server) = reader_server.as_str() {
            logger_map.insert(logger_id.clone(), reader_server.to_owned());
        }
    }
    tracing::debug!(entries = logger_map.len(), "logger map updated");
}

/// Resolve the data-log reader answering for `device_id`, spreading requests
/// over the reader replicas.
pub fn data_reader_id(gateway: &Gateway, device_id: &str) -> Option<String> {
    let logger_id = format!("{LOGGER_PREFIX}{device_id}");
    let logger_map = lock(&gateway.logger_map);
    let reader_server = logger_map.get(&logger_id)?;
    let replica = gateway.reader_round_robin.fetch_add(1, Ordering::Relaxed) % READERS_PER_SERVER;
    Some(format!("{READER_PREFIX}{replica}-{reader_server}"))
}

pub fn on_get_property_history(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(device_id) = messages::str_field(&msg, "deviceId").map(str::to_owned) else {
        return refuse_decode(client, "getPropertyHistory", "deviceId");
    };
    let Some(property) = messages::str_field(&msg, "property").map(str::to_owned) else {
        return refuse_decode(client, "getPropertyHistory", "property");
    };
    let Some(t0) = messages::str_field(&msg, "t0").map(str::to_owned) else {
        return refuse_decode(client, "getPropertyHistory", "t0");
    };
    let Some(t1) = messages::str_field(&msg, "t1").map(str::to_owned) else {
        return refuse_decode(client, "getPropertyHistory", "t1");
    };
    let max_num_data = messages::i64_field(&msg, "maxNumData").unwrap_or(0);
    tracing::debug!(device_id, property, t0, t1, max_num_data, "property history request");

    let Some(reader_id) = data_reader_id(gateway, &device_id) else {
        tracing::warn!(device_id, "no data logger known for device");
        client.send(
            Priority::RemoveOldest,
            json!({
                "type": "propertyHistory",
                "deviceId": device_id,
                "property": property,
                "data": [],
                "success": false,
                "failureReason": format!("No data logger known for device '{device_id}'"),
            }),
        );
        return;
    };

    let args = json!({
        "deviceId": device_id,
        "property": property,
        "args": { "from": t0, "to": t1, "maxNumData": max_num_data },
    });
    let gateway = Arc::clone(gateway);
    let weak = Arc::downgrade(client);
    tokio::spawn(async move {
        let result =
            gateway.remote.request(&reader_id, "slotGetPropertyHistory", args, None).await;
        let reply = match result {
            Ok(reply) => {
                let data = reply.get("data").cloned().unwrap_or_else(|| json!([]));
                json!({
                    "type": "propertyHistory",
                    "deviceId": device_id,
                    "property": property,
                    "data": data,
                    "success": true,
                    "failureReason": "",
                })
            }
            Err(e) => {
                tracing::info!(device_id, property, err = %e, "property history request failed");
                json!({
                    "type": "propertyHistory",
                    "deviceId": device_id,
                    "property": property,
                    "data": [],
                    "success": false,
                    "failureReason": e.to_string(),
                })
            }
        };
        if let Some(client) = weak.upgrade() {
            client.send(Priority::RemoveOldest, reply);
        }
    });
}

pub fn on_get_configuration_from_past(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(device_id) = messages::str_field(&msg, "deviceId").map(str::to_owned) else {
        return refuse_decode(client, "getConfigurationFromPast", "deviceId");
    };
    let Some(time) = messages::str_field(&msg, "time").map(str::to_owned) else {
        return refuse_decode(client, "getConfigurationFromPast", "time");
    };
    let preview = messages::bool_field(&msg, "preview").unwrap_or(false);
    tracing::debug!(device_id, time, preview, "configuration-from-past request");

    let Some(reader_id) = data_reader_id(gateway, &device_id) else {
        tracing::warn!(device_id, "no data logger known for device");
        client.send(
            Priority::RemoveOldest,
            json!({
                "type": "configurationFromPast",
                "deviceId": device_id,
                "time": time,
                "preview": preview,
                "success": false,
                "reason": format!("No data logger known for device '{device_id}'"),
            }),
        );
        return;
    };

    let args = json!({ "deviceId": device_id, "time": time });
    let gateway = Arc::clone(gateway);
    let weak = Arc::downgrade(client);
    tokio::spawn(async move {
        let result = gateway
            .remote
            .request(
                &reader_id,
                "slotGetConfigurationFromPast",
                args,
                Some(CONFIG_FROM_PAST_TIMEOUT),
            )
            .await;
        let reply = match result {
            Ok(reply) => {
                let config = reply.get("config").cloned().unwrap_or(Value::Null);
                let empty = config.as_object().map(serde_json::Map::is_empty).unwrap_or(true);
                if empty {
                    // Readers answer an empty configuration instead of an
                    // error when the device was not logged at that time.
                    json!({
                        "type": "configurationFromPast",
                        "deviceId": device_id,
                        "time": time,
                        "preview": preview,
                        "success": false,
                        "reason": format!(
                            "Received empty configuration:\nLikely '{device_id}' has not been online (or not logging) until the requested time '{time}'."
                        ),
                    })
                } else {
                    json!({
                        "type": "configurationFromPast",
                        "deviceId": device_id,
                        "time": time,
                        "preview": preview,
                        "success": true,
                        "config": config,
                        "configAtTimepoint": reply.get("configAtTimepoint").cloned().unwrap_or(Value::Bool(false)),
                        "configTimepoint": reply.get("configTimepoint").cloned().unwrap_or_default(),
                    })
                }
            }
            Err(e) => {
                let reason = match &e {
                    crate::remote::RemoteError::Timeout { .. } => {
                        "Request timed out:\nProbably the data logging infrastructure is not available."
                            .to_owned()
                    }
                    crate::remote::RemoteError::Remote(details) => {
                        tracing::debug!(device_id, time, details, "configuration-from-past failed");
                        "Request for a configuration from the past failed.".to_owned()
                    }
                };
                json!({
                    "type": "configurationFromPast",
                    "deviceId": device_id,
                    "time": time,
                    "preview": preview,
                    "success": false,
                    "reason": reason,
                })
            }
        };
        if let Some(client) = weak.upgrade() {
            client.send(Priority::RemoveOldest, reply);
        }
    });
}

#[cfg(test)]
#[path = "history_tests.rs"]
mod tests;
