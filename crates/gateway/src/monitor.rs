// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Reference-counted device monitoring and configuration/schema fan-out.
//!
//! The first client interested in a device opens the single upstream monitor
//! subscription; the last one leaving closes it. Upstream update batches are
//! fanned out per client, restricted to the devices that client watches, as
//! one `deviceConfigurations` message per batch.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::messages;
use crate::queue::Priority;
use crate::state::{lock, ClientHandle, Gateway};

/// Begin monitoring `device_id` on behalf of `client`, then push the current
/// configuration if one is cached (otherwise the upstream reply comes through
/// the regular update path).
pub async fn start_monitor(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, device_id: &str) {
    lock(&client.record).visible_instances.insert(device_id.to_owned());

    let fresh = {
        let mut monitors = lock(&gateway.monitors);
        let refcount = monitors.entry(device_id.to_owned()).or_insert(0);
        *refcount += 1;
        tracing::debug!(client_id = client.id, device_id, refcount = *refcount, "start monitoring");
        *refcount == 1
    };
    if fresh {
        gateway.remote.register_device_monitor(device_id).await;
    }

    if let Some(configuration) = gateway.remote.cached_configuration(device_id).await {
        client.send(
            Priority::Lossless,
            messages::single_device_configuration(device_id, configuration),
        );
    }
}

/// Drop `client`'s interest in `device_id`, releasing the upstream monitor
/// when the reference count reaches zero.
pub async fn stop_monitor(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, device_id: &str) {
    lock(&client.record).visible_instances.remove(device_id);

    let released = {
        let mut monitors = lock(&gateway.monitors);
        match monitors.get_mut(device_id) {
            Some(refcount) => {
                *refcount = refcount.saturating_sub(1);
                tracing::debug!(client_id = client.id, device_id, refcount = *refcount, "stop monitoring");
                if *refcount == 0 {
                    monitors.remove(device_id);
                    true
                } else {
                    false
                }
            }
            None => {
                tracing::warn!(client_id = client.id, device_id, "stop for a device never monitored");
                false
            }
        }
    };
    if released {
        gateway.remote.unregister_device_monitor(device_id).await;
    }
}

/// Fan one upstream update batch (`device id -> delta`) out to the clients,
/// each restricted to its visible devices. Batch boundaries are preserved:
/// every interested client gets exactly one message per upstream batch.
pub fn on_devices_changed(gateway: &Gateway, updates: &Value) {
    let Some(updates) = updates.as_object() else {
        return;
    };
    gateway.for_each_client(|client| {
        let mut subset = Map::new();
        {
            let record = lock(&client.record);
            for (device_id, delta) in updates {
                if record.visible_instances.contains(device_id) {
                    subset.insert(device_id.clone(), delta.clone());
                }
            }
        }
        if !subset.is_empty() {
            client.send(Priority::Lossless, messages::device_configurations(subset));
        }
    });
}

/// Push an updated device schema to every client that watches the device or
/// has asked for the schema, clearing the request marks.
pub fn on_schema_updated(gateway: &Gateway, device_id: &str, schema: &Value) {
    if schema.is_null() {
        tracing::warn!(device_id, "forwarding an empty schema");
    }
    let message = messages::device_schema(device_id, schema.clone());
    gateway.for_each_client(|client| {
        let mut record = lock(&client.record);
        let requested = record.requested_device_schemas.remove(device_id);
        if requested || record.visible_instances.contains(device_id) {
            client.send(Priority::Lossless, message.clone());
        }
    });
}

/// Answer clients with an outstanding class-schema request. Requests are
/// cleared even for an empty schema (a schema of a non-existing plugin, for
/// example); no answer goes out in that case.
pub fn on_class_schema(gateway: &Gateway, server_id: &str, class_id: &str, schema: &Value) {
    let message = messages::class_schema(server_id, class_id, schema.clone());
    gateway.for_each_client(|client| {
        let mut record = lock(&client.record);
        let Some(pending) = record.requested_class_schemas.get_mut(server_id) else {
            return;
        };
        if !pending.remove(class_id) {
            return;
        }
        if pending.is_empty() {
            record.requested_class_schemas.remove(server_id);
        }
        if !schema.is_null() {
            client.send(Priority::Lossless, message.clone());
        }
    });
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
