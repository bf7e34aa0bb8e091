// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Typed-message dispatch for logged-in clients.
//!
//! Every inbound message carries a `type` string resolved through the fixed
//! table in [`dispatch`]. Handlers come in three shapes: fire-and-forget
//! (validate, invoke the remote slot, return), await-reply (spawn a
//! continuation that performs the request and answers the originating client
//! exactly once), and server-local (mutate gateway state or answer from
//! caches). Failures cross the wire as `success`/`failureReason` payload
//! fields, never as transport errors.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{json, Value};

use crate::error::FailureKind;
use crate::history;
use crate::instantiate;
use crate::messages;
use crate::monitor;
use crate::pipeline;
use crate::project;
use crate::queue::Priority;
use crate::remote::RemoteError;
use crate::state::{lock, ClientHandle, Gateway};

/// Message types refused entirely on a read-only gateway.
const WRITE_COMMANDS: &[&str] = &[
    "projectSaveItems",
    "initDevice",
    "killDevice",
    "execute",
    "killServer",
    "acknowledgeAlarm",
    "projectUpdateAttribute",
    "reconfigure",
    "updateAttributes",
];

/// Per-type minimum client versions, checked after login.
fn min_version_restriction(msg_type: &str) -> Option<semver::Version> {
    match msg_type {
        "projectSaveItems" | "projectUpdateAttribute" => Some(semver::Version::new(2, 10, 0)),
        _ => None,
    }
}

/// Route one decoded client message.
pub async fn dispatch(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(msg_type) = messages::msg_type(&msg) else {
        tracing::warn!(
            client_id = client.id,
            kind = %FailureKind::Decode,
            "ignoring request without type"
        );
        return;
    };
    let msg_type = msg_type.to_owned();

    if gateway.config.read_only && violates_read_only(&msg_type, &msg) {
        tracing::warn!(client_id = client.id, kind = %FailureKind::ReadOnlyRefused, %msg_type, "refused");
        client.send(
            Priority::Lossless,
            messages::notification(format!(
                "Action '{msg_type}' is not allowed on gateways in read-only mode!"
            )),
        );
        return;
    }

    if let Some(minimum) = min_version_restriction(&msg_type) {
        let version = lock(&client.record).version.clone();
        if version < minimum {
            tracing::warn!(
                client_id = client.id,
                kind = %FailureKind::VersionTooOld,
                %msg_type,
                %version,
                "refused"
            );
            client.send(
                Priority::Lossless,
                messages::notification(format!(
                    "Action '{msg_type}' is not allowed on this client version. Please upgrade your client"
                )),
            );
            return;
        }
    }

    match msg_type.as_str() {
        "reconfigure" => on_reconfigure(gateway, client, msg),
        "execute" => on_execute(gateway, client, msg),
        "killDevice" => on_kill_device(gateway, client, msg),
        "killServer" => on_kill_server(gateway, client, msg),
        "initDevice" => instantiate::on_init_device(gateway, client, msg),
        "getDeviceConfiguration" => on_get_device_configuration(gateway, client, msg).await,
        "getDeviceSchema" => on_get_device_schema(gateway, client, msg).await,
        "getClassSchema" => on_get_class_schema(gateway, client, msg).await,
        "startMonitoringDevice" => {
            if let Some(device_id) = messages::str_field(&msg, "deviceId") {
                monitor::start_monitor(gateway, client, device_id).await;
            } else {
                refuse_decode(client, &msg_type, "deviceId");
            }
        }
        "stopMonitoringDevice" => {
            if let Some(device_id) = messages::str_field(&msg, "deviceId") {
                monitor::stop_monitor(gateway, client, device_id).await;
            } else {
                refuse_decode(client, &msg_type, "deviceId");
            }
        }
        "getPropertyHistory" => history::on_get_property_history(gateway, client, msg),
        "getConfigurationFromPast" => history::on_get_configuration_from_past(gateway, client, msg),
        "subscribeNetwork" => on_subscribe_network(gateway, client, msg).await,
        "requestNetwork" => {
            if let Some(channel_name) = messages::str_field(&msg, "channelName") {
                pipeline::request_more(gateway, client, channel_name);
            } else {
                refuse_decode(client, &msg_type, "channelName");
            }
        }
        "requestGeneric" => on_request_generic(gateway, client, msg),
        "requestFromSlot" => on_request_from_slot(gateway, client, msg),
        "updateAttributes" => on_update_attributes(gateway, client, msg),
        "acknowledgeAlarm" => on_acknowledge_alarm(gateway, client, msg),
        "requestAlarms" => {
            if let Some(alarm_id) = messages::str_field(&msg, "alarmInstanceId") {
                request_alarm_dump(gateway, alarm_id.to_owned(), Some(Arc::downgrade(client)));
            } else {
                refuse_decode(client, &msg_type, "alarmInstanceId");
            }
        }
        "error" => on_gui_error(gateway, msg),
        "projectBeginUserSession" => project::on_begin_user_session(gateway, client, msg),
        "projectEndUserSession" => project::on_end_user_session(gateway, client, msg),
        "projectSaveItems" => project::on_save_items(gateway, client, msg),
        "projectLoadItems" => project::on_load_items(gateway, client, msg),
        "projectListProjectManagers" => project::on_list_project_managers(gateway, client),
        "projectListItems" => project::on_list_items(gateway, client, msg),
        "projectListDomains" => project::on_list_domains(gateway, client, msg),
        "projectUpdateAttribute" => project::on_update_attribute(gateway, client, msg),
        _ => {
            tracing::warn!(client_id = client.id, %msg_type, "ignoring request of unknown type");
            client.send(
                Priority::Lossless,
                messages::notification(format!(
                    "The gateway with version {} does not support the client application request of {msg_type}",
                    env!("CARGO_PKG_VERSION")
                )),
            );
        }
    }
}

/// Mutating requests are refused wholesale in read-only mode; generic
/// requests are allowed only towards the scene-providing slots.
fn violates_read_only(msg_type: &str, msg: &Value) -> bool {
    if WRITE_COMMANDS.contains(&msg_type) {
        return true;
    }
    if msg_type == "requestGeneric" || msg_type == "requestFromSlot" {
        if let Some(slot) = messages::str_field(msg, "slot") {
            return slot != "requestScene" && slot != "slotGetScene";
        }
    }
    false
}

pub(crate) fn refuse_decode(client: &ClientHandle, msg_type: &str, field: &str) {
    tracing::warn!(
        client_id = client.id,
        kind = %FailureKind::Decode,
        msg_type,
        field,
        "request lacks required field"
    );
    client.send(
        Priority::Lossless,
        messages::notification(format!("Request '{msg_type}' lacks required field '{field}'")),
    );
}

/// Effective timeout for a slot request: the maximum of what the client asked
/// for and the configured lower bound. `None` (fabric default) when the
/// client sent no timeout or the target belongs to an ignore-timeout class.
pub(crate) fn effective_timeout(
    gateway: &Gateway,
    msg: &Value,
    instance_key: &str,
) -> Option<Duration> {
    let requested = messages::i64_field(msg, "timeout")?;
    if let Some(instance_id) = messages::str_field(msg, instance_key) {
        if gateway.is_timing_out(instance_id) {
            return None;
        }
    }
    let effective = requested.max(gateway.config.timeout_secs as i64).max(0);
    Some(Duration::from_secs(effective as u64))
}

/// Invoke a remote slot without waiting for an answer.
pub(crate) fn fire_and_forget(
    gateway: &Arc<Gateway>,
    instance_id: String,
    slot: String,
    args: Value,
) {
    let gateway = Arc::clone(gateway);
    tokio::spawn(async move {
        if let Err(e) = gateway.remote.call(&instance_id, &slot, args).await {
            tracing::warn!(instance_id, slot, err = %e, "fire-and-forget slot call failed");
        }
    });
}

/// Perform a remote request in a continuation task and answer the originating
/// client exactly once, whatever the outcome.
fn spawn_request_reply<F>(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientHandle>,
    instance_id: String,
    slot: String,
    args: Value,
    timeout: Option<Duration>,
    priority: Priority,
    build: F,
) where
    F: FnOnce(&Gateway, Result<Value, RemoteError>) -> Value + Send + 'static,
{
    let gateway = Arc::clone(gateway);
    let weak: Weak<ClientHandle> = Arc::downgrade(client);
    tokio::spawn(async move {
        let result = gateway.remote.request(&instance_id, &slot, args, timeout).await;
        let reply = build(&gateway, result);
        if let Some(client) = weak.upgrade() {
            client.send(priority, reply);
        }
    });
}

// -- reconfigure / execute ----------------------------------------------------

fn on_reconfigure(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(device_id) = messages::str_field(&msg, "deviceId").map(str::to_owned) else {
        return refuse_decode(client, "reconfigure", "deviceId");
    };
    let Some(configuration) = msg.get("configuration").cloned() else {
        return refuse_decode(client, "reconfigure", "configuration");
    };
    let args = json!({ "configuration": configuration });

    if messages::bool_field(&msg, "reply").unwrap_or(false) {
        let timeout = effective_timeout(gateway, &msg, "deviceId");
        spawn_request_reply(
            gateway,
            client,
            device_id,
            "slotReconfigure".to_owned(),
            args,
            timeout,
            Priority::Lossless,
            move |gateway, result| build_reconfigure_reply(gateway, msg, result),
        );
    } else {
        fire_and_forget(gateway, device_id, "slotReconfigure".to_owned(), args);
    }
}

fn build_reconfigure_reply(
    gateway: &Gateway,
    input: Value,
    result: Result<Value, RemoteError>,
) -> Value {
    match result {
        Ok(_) => json!({ "type": "reconfigureReply", "success": true, "input": input }),
        Err(err) => {
            let paths: Vec<&str> = input
                .get("configuration")
                .and_then(Value::as_object)
                .map(|configuration| configuration.keys().map(String::as_str).collect())
                .unwrap_or_default();
            let device_id = messages::str_field(&input, "deviceId").unwrap_or("?");
            let base = format!(
                "Failure on request to reconfigure '{}' of device '{device_id}'",
                paths.join(",")
            );
            let (success, reason) = classify_slot_failure(gateway, &input, "deviceId", base, &err);
            json!({
                "type": "reconfigureReply",
                "success": success,
                "input": input,
                "failureReason": reason,
            })
        }
    }
}

fn on_execute(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(device_id) = messages::str_field(&msg, "deviceId").map(str::to_owned) else {
        return refuse_decode(client, "execute", "deviceId");
    };
    let Some(command) = messages::str_field(&msg, "command").map(str::to_owned) else {
        return refuse_decode(client, "execute", "command");
    };

    if messages::bool_field(&msg, "reply").unwrap_or(false) {
        let timeout = effective_timeout(gateway, &msg, "deviceId");
        spawn_request_reply(
            gateway,
            client,
            device_id,
            command,
            json!({}),
            timeout,
            Priority::Lossless,
            move |gateway, result| build_execute_reply(gateway, msg, result),
        );
    } else {
        fire_and_forget(gateway, device_id, command, json!({}));
    }
}

fn build_execute_reply(gateway: &Gateway, input: Value, result: Result<Value, RemoteError>) -> Value {
    match result {
        Ok(_) => json!({ "type": "executeReply", "success": true, "input": input }),
        Err(err) => {
            let command = messages::str_field(&input, "command").unwrap_or("?");
            let device_id = messages::str_field(&input, "deviceId").unwrap_or("?");
            let base =
                format!("Failure on request to execute '{command}' on device '{device_id}'");
            let (success, reason) = classify_slot_failure(gateway, &input, "deviceId", base, &err);
            json!({
                "type": "executeReply",
                "success": success,
                "input": input,
                "failureReason": reason,
            })
        }
    }
}

/// Classify a slot failure for the reply payload.
///
/// A timeout is downgraded to `success = true` when the client supplied no
/// timeout of its own or the target is of an ignore-timeout class; the
/// failure reason still explains what happened. Remote errors are always
/// failures and carry the remote message.
fn classify_slot_failure(
    gateway: &Gateway,
    input: &Value,
    instance_key: &str,
    base: String,
    err: &RemoteError,
) -> (bool, String) {
    match err {
        RemoteError::Timeout { waited } => {
            let ignored = input.get("timeout").is_none()
                || messages::str_field(input, instance_key)
                    .is_some_and(|instance_id| gateway.is_timing_out(instance_id));
            let reason =
                format!("{base}. Request not answered within {} seconds.", waited.as_secs());
            tracing::warn!(kind = %FailureKind::Timeout, ignored, "{reason}");
            (ignored, reason)
        }
        RemoteError::Remote(message) => {
            let reason = format!("{base}, details:\n{message}");
            tracing::warn!(kind = %FailureKind::Remote, "{reason}");
            (false, reason)
        }
    }
}

// -- kill ---------------------------------------------------------------------

fn on_kill_device(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(device_id) = messages::str_field(&msg, "deviceId").map(str::to_owned) else {
        return refuse_decode(client, "killDevice", "deviceId");
    };
    tracing::debug!(client_id = client.id, device_id, "killDevice");
    fire_and_forget(gateway, device_id, "slotKillDevice".to_owned(), json!({}));
}

fn on_kill_server(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(server_id) = messages::str_field(&msg, "serverId").map(str::to_owned) else {
        return refuse_decode(client, "killServer", "serverId");
    };
    tracing::debug!(client_id = client.id, server_id, "killServer");
    fire_and_forget(gateway, server_id, "slotKillServer".to_owned(), json!({}));
}

// -- server-local cache answers ----------------------------------------------

async fn on_get_device_configuration(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientHandle>,
    msg: Value,
) {
    let Some(device_id) = messages::str_field(&msg, "deviceId") else {
        return refuse_decode(client, "getDeviceConfiguration", "deviceId");
    };
    match gateway.remote.cached_configuration(device_id).await {
        Some(configuration) => {
            client.send(
                Priority::Lossless,
                messages::single_device_configuration(device_id, configuration),
            );
        }
        None => {
            tracing::debug!(client_id = client.id, device_id, "configuration not cached, expect later answer");
        }
    }
}

async fn on_get_device_schema(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(device_id) = messages::str_field(&msg, "deviceId") else {
        return refuse_decode(client, "getDeviceSchema", "deviceId");
    };
    match gateway.remote.cached_device_schema(device_id).await {
        Some(schema) => client.send(Priority::Lossless, messages::device_schema(device_id, schema)),
        None => {
            lock(&client.record).requested_device_schemas.insert(device_id.to_owned());
            tracing::debug!(client_id = client.id, device_id, "schema not cached, expect later answer");
        }
    }
}

async fn on_get_class_schema(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(server_id) = messages::str_field(&msg, "serverId") else {
        return refuse_decode(client, "getClassSchema", "serverId");
    };
    let Some(class_id) = messages::str_field(&msg, "classId") else {
        return refuse_decode(client, "getClassSchema", "classId");
    };
    match gateway.remote.cached_class_schema(server_id, class_id).await {
        Some(schema) => {
            client.send(Priority::Lossless, messages::class_schema(server_id, class_id, schema));
        }
        None => {
            lock(&client.record)
                .requested_class_schemas
                .entry(server_id.to_owned())
                .or_default()
                .insert(class_id.to_owned());
            tracing::debug!(client_id = client.id, server_id, class_id, "class schema not cached, expect later answer");
        }
    }
}

// -- pipeline subscription ----------------------------------------------------

async fn on_subscribe_network(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(channel_name) = messages::str_field(&msg, "channelName") else {
        return refuse_decode(client, "subscribeNetwork", "channelName");
    };
    let Some(wants) = messages::bool_field(&msg, "subscribe") else {
        return refuse_decode(client, "subscribeNetwork", "subscribe");
    };
    if wants {
        pipeline::subscribe(gateway, client, channel_name).await;
    } else {
        pipeline::unsubscribe(gateway, client, channel_name).await;
    }
}

// -- generic requests ---------------------------------------------------------

fn on_request_generic(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(instance_id) = messages::str_field(&msg, "instanceId").map(str::to_owned) else {
        return refuse_decode(client, "requestGeneric", "instanceId");
    };
    let Some(slot) = messages::str_field(&msg, "slot").map(str::to_owned) else {
        return refuse_decode(client, "requestGeneric", "slot");
    };
    let args = msg.get("args").cloned().unwrap_or_else(|| json!({}));
    let timeout = effective_timeout(gateway, &msg, "instanceId");
    spawn_request_reply(
        gateway,
        client,
        instance_id,
        slot,
        args,
        timeout,
        Priority::Lossless,
        move |_, result| build_generic_reply(msg, result),
    );
}

fn build_generic_reply(info: Value, result: Result<Value, RemoteError>) -> Value {
    let reply_type =
        messages::str_field(&info, "replyType").unwrap_or("requestGeneric").to_owned();
    let request_echo = if info.get("empty").is_some() { json!({}) } else { info.clone() };
    match result {
        Ok(reply) => json!({
            "type": reply_type,
            "success": true,
            "request": request_echo,
            "reply": reply,
            "reason": "",
        }),
        Err(err) => {
            let instance_id = messages::str_field(&info, "instanceId").unwrap_or("?");
            let slot = messages::str_field(&info, "slot").unwrap_or("?");
            let reason = format!("Failure on request to {instance_id}.{slot}, {err}");
            tracing::warn!("{reason}");
            json!({
                "type": reply_type,
                "success": false,
                "request": request_echo,
                "reply": {},
                "reason": reason,
            })
        }
    }
}

fn on_request_from_slot(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let failure_info = json!({
        "deviceId": msg.get("deviceId").is_some(),
        "slot": msg.get("slot").is_some(),
        "args": msg.get("args").is_some(),
        "token": msg.get("token").is_some(),
    });
    let token =
        messages::str_field(&msg, "token").unwrap_or("undefined").to_owned();
    let (Some(device_id), Some(slot), Some(args)) = (
        messages::str_field(&msg, "deviceId").map(str::to_owned),
        messages::str_field(&msg, "slot").map(str::to_owned),
        msg.get("args").cloned(),
    ) else {
        tracing::warn!(client_id = client.id, kind = %FailureKind::Decode, "malformed requestFromSlot");
        client.send(
            Priority::Lossless,
            json!({
                "type": "requestFromSlot",
                "success": false,
                "info": failure_info,
                "token": token,
            }),
        );
        return;
    };

    spawn_request_reply(
        gateway,
        client,
        device_id,
        slot,
        args,
        None,
        Priority::Lossless,
        move |_, result| match result {
            Ok(reply) => json!({
                "type": "requestFromSlot",
                "success": true,
                "reply": reply,
                "token": token,
            }),
            Err(err) => {
                let mut info = failure_info;
                if let Some(info) = info.as_object_mut() {
                    info.insert("replied_error".to_owned(), Value::String(err.to_string()));
                }
                json!({
                    "type": "requestFromSlot",
                    "success": false,
                    "info": info,
                    "token": token,
                })
            }
        },
    );
}

// -- attributes / alarms / debug ---------------------------------------------

fn on_update_attributes(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(instance_id) = messages::str_field(&msg, "instanceId").map(str::to_owned) else {
        return refuse_decode(client, "updateAttributes", "instanceId");
    };
    let Some(updates) = msg.get("updates").cloned() else {
        return refuse_decode(client, "updateAttributes", "updates");
    };
    spawn_request_reply(
        gateway,
        client,
        instance_id,
        "slotUpdateSchemaAttributes".to_owned(),
        json!({ "updates": updates }),
        None,
        Priority::Lossless,
        |_, result| match result {
            Ok(reply) => json!({ "type": "attributesUpdated", "reply": reply }),
            Err(err) => json!({
                "type": "attributesUpdated",
                "reply": { "success": false, "reason": err.to_string() },
            }),
        },
    );
}

fn on_acknowledge_alarm(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(alarm_id) = messages::str_field(&msg, "alarmInstanceId").map(str::to_owned) else {
        return refuse_decode(client, "acknowledgeAlarm", "alarmInstanceId");
    };
    let Some(rows) = msg.get("acknowledgedRows").cloned() else {
        return refuse_decode(client, "acknowledgeAlarm", "acknowledgedRows");
    };
    fire_and_forget(
        gateway,
        alarm_id,
        "slotAcknowledgeAlarm".to_owned(),
        json!({ "acknowledgedRows": rows }),
    );
}

/// Ask an alarm service for its full dump and answer with `alarmInit`, either
/// to one client or to all of them when the service was just discovered.
/// Pending topology changes are flushed first so clients see an instance
/// before any alarm row referring to it.
pub(crate) fn request_alarm_dump(
    gateway: &Arc<Gateway>,
    alarm_instance_id: String,
    target: Option<Weak<ClientHandle>>,
) {
    let gateway = Arc::clone(gateway);
    tokio::spawn(async move {
        let reply = match gateway
            .remote
            .request(&alarm_instance_id, "slotRequestAlarmDump", json!({}), None)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(alarm_instance_id, err = %e, "alarm dump request failed");
                return;
            }
        };
        gateway.flush_topology_changes();
        let message = json!({
            "type": "alarmInit",
            "instanceId": reply.get("instanceId").cloned().unwrap_or(Value::String(alarm_instance_id)),
            "rows": reply.get("alarms").cloned().unwrap_or_else(|| json!({})),
        });
        match target {
            Some(weak) => {
                if let Some(client) = weak.upgrade() {
                    client.send(Priority::Lossless, message);
                }
            }
            None => gateway.broadcast(message, Priority::Lossless),
        }
    });
}

fn on_gui_error(gateway: &Arc<Gateway>, msg: Value) {
    let gateway = Arc::clone(gateway);
    tokio::spawn(async move {
        if let Err(e) = gateway.remote.publish_debug(msg).await {
            tracing::debug!(err = %e, "debug publish failed");
        }
    });
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
