// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Rate-limited device instantiation and the pending attribute-update
//! machine.
//!
//! Instantiation requests queue up and are sent to the device servers one per
//! timer tick, so a client loading a big project cannot stampede the fabric.
//! Schema-attribute updates supplied with a request are held until both the
//! instance announcement and the server's start reply have been seen; an
//! instance-gone in between drops them.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::messages;
use crate::queue::Priority;
use crate::remote::RemoteError;
use crate::router::refuse_decode;
use crate::state::{lock, AttributeUpdates, ClientHandle, Gateway, Instantiation};

pub const INSTANCE_NEW_EVENT: u8 = 0x01;
pub const SERVER_REPLY_EVENT: u8 = 0x02;
const FULL_MASK: u8 = INSTANCE_NEW_EVENT | SERVER_REPLY_EVENT;

/// Transitions of the per-device pending-attribute machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeEvent {
    InstanceNew,
    ServerReply,
    /// Reset: the device disappeared (or never started), drop the updates.
    InstanceGone,
}

/// Queue a device instantiation. Serviced by the pump, one per tick.
pub fn on_init_device(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(server_id) = messages::str_field(&msg, "serverId") else {
        return refuse_decode(client, "initDevice", "serverId");
    };
    let Some(device_id) = messages::str_field(&msg, "deviceId") else {
        return refuse_decode(client, "initDevice", "deviceId");
    };
    tracing::debug!(client_id = client.id, server_id, device_id, "queuing device instantiation");

    if !device_id.is_empty() {
        if let Some(updates) = msg.get("schemaUpdates").and_then(Value::as_array) {
            lock(&gateway.pending_attributes).insert(
                device_id.to_owned(),
                AttributeUpdates { mask: 0, updates: updates.clone() },
            );
        }
    }

    lock(&gateway.pending_instantiations)
        .push_back(Instantiation { client: Arc::downgrade(client), payload: msg });
}

/// Dequeue at most one instantiation per `wait_init_device` tick.
///
/// A device server refusing the start is a normal outcome, answered through
/// `initReply`. An upstream request error is logged and stops this timer from
/// re-arming; only the topology throttler re-arms unconditionally.
pub fn spawn_instantiation_pump(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(gateway.config.wait_init_device());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = gateway.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let next = lock(&gateway.pending_instantiations).pop_front();
            if let Some(instantiation) = next {
                if let Err(e) = run_instantiation(&gateway, instantiation).await {
                    tracing::error!(err = %e, "device instantiation request failed, instantiation timer will not re-arm");
                    break;
                }
            }
        }
    });
}

async fn run_instantiation(
    gateway: &Arc<Gateway>,
    instantiation: Instantiation,
) -> Result<(), RemoteError> {
    let payload = instantiation.payload;
    let server_id = messages::str_field(&payload, "serverId").unwrap_or_default().to_owned();
    let device_id = messages::str_field(&payload, "deviceId").unwrap_or_default().to_owned();
    tracing::debug!(%server_id, %device_id, "requesting device start");

    let result = gateway.remote.request(&server_id, "slotStartDevice", payload, None).await;
    let (success, message) = match &result {
        Ok(reply) => (
            messages::bool_field(reply, "success").unwrap_or(true),
            messages::str_field(reply, "message").unwrap_or_default().to_owned(),
        ),
        Err(e) => (false, e.to_string()),
    };

    if let Some(client) = instantiation.client.upgrade() {
        client.send(
            Priority::Lossless,
            json!({
                "type": "initReply",
                "deviceId": device_id,
                "success": success,
                "message": message,
            }),
        );
    }

    let event =
        if success { AttributeEvent::ServerReply } else { AttributeEvent::InstanceGone };
    attribute_event(gateway, &device_id, event).await;
    result.map(|_| ())
}

/// Drive the pending-attribute machine for one device. The stored updates are
/// sent upstream once both event bits are present; taking them out of the
/// table makes the send at-most-once.
pub async fn attribute_event(gateway: &Arc<Gateway>, device_id: &str, event: AttributeEvent) {
    let updates = {
        let mut pending = lock(&gateway.pending_attributes);
        let Some(entry) = pending.get_mut(device_id) else {
            return;
        };
        match event {
            AttributeEvent::InstanceGone => {
                pending.remove(device_id);
                return;
            }
            AttributeEvent::InstanceNew => entry.mask |= INSTANCE_NEW_EVENT,
            AttributeEvent::ServerReply => entry.mask |= SERVER_REPLY_EVENT,
        }
        if entry.mask & FULL_MASK != FULL_MASK {
            tracing::debug!(device_id, mask = entry.mask, "attribute updates still pending");
            return;
        }
        pending.remove(device_id).map(|entry| entry.updates)
    };

    let Some(updates) = updates else { return };
    tracing::debug!(device_id, "sending schema attribute updates");
    match gateway
        .remote
        .request(device_id, "slotUpdateSchemaAttributes", json!({ "updates": updates }), None)
        .await
    {
        Ok(reply) => {
            if !messages::bool_field(&reply, "success").unwrap_or(true) {
                tracing::error!(device_id, "schema attribute update refused");
            }
        }
        Err(e) => tracing::error!(device_id, err = %e, "schema attribute update failed"),
    }
}

#[cfg(test)]
#[path = "instantiate_tests.rs"]
mod tests;
