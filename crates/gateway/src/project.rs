// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Project-manager bridge: the set of known project-manager devices and the
//! client operations proxied to them.
//!
//! Managers are discovered from topology (class id `ProjectManager`) and
//! dropped when their instance disappears. Requests naming an unknown
//! manager are refused at the boundary with a failed typed reply.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::messages;
use crate::queue::Priority;
use crate::router::refuse_decode;
use crate::state::{read_lock, write_lock, ClientHandle, Gateway};

pub fn register_manager(gateway: &Gateway, instance_id: &str) {
    if write_lock(&gateway.project_managers).insert(instance_id.to_owned()) {
        tracing::info!(instance_id, "project manager registered");
    }
}

pub fn remove_manager(gateway: &Gateway, instance_id: &str) {
    if write_lock(&gateway.project_managers).remove(instance_id) {
        tracing::info!(instance_id, "project manager gone");
    }
}

pub fn known_managers(gateway: &Gateway) -> Vec<String> {
    let mut managers: Vec<String> =
        read_lock(&gateway.project_managers).iter().cloned().collect();
    managers.sort();
    managers
}

/// Validate the `projectManager` field; answers a failed reply and returns
/// `None` when the manager is unknown.
fn checked_manager(
    gateway: &Gateway,
    client: &Arc<ClientHandle>,
    msg: &Value,
    reply_type: &str,
    reason: &str,
) -> Option<String> {
    let Some(manager) = messages::str_field(msg, "projectManager") else {
        refuse_decode(client, reply_type, "projectManager");
        return None;
    };
    if read_lock(&gateway.project_managers).contains(manager) {
        return Some(manager.to_owned());
    }
    client.send(
        Priority::Lossless,
        json!({ "type": reply_type, "reply": { "success": false, "reason": reason } }),
    );
    None
}

/// Proxy one project operation and forward the manager's reply verbatim.
fn proxy(
    gateway: &Arc<Gateway>,
    client: &Arc<ClientHandle>,
    manager: String,
    slot: &'static str,
    args: Value,
    reply_type: &'static str,
) {
    let gateway = Arc::clone(gateway);
    let weak = Arc::downgrade(client);
    tokio::spawn(async move {
        let reply = match gateway.remote.request(&manager, slot, args, None).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(manager, slot, err = %e, "project request failed");
                json!({ "success": false, "reason": e.to_string() })
            }
        };
        if let Some(client) = weak.upgrade() {
            client.send(Priority::Lossless, json!({ "type": reply_type, "reply": reply }));
        }
    });
}

pub fn on_begin_user_session(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectBeginUserSession",
        "Project manager does not exist: Begin User Session failed.",
    ) else {
        return;
    };
    let token = msg.get("token").cloned().unwrap_or_default();
    proxy(
        gateway,
        client,
        manager,
        "slotBeginUserSession",
        json!({ "token": token }),
        "projectBeginUserSession",
    );
}

pub fn on_end_user_session(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectEndUserSession",
        "Project manager does not exist: End User Session failed.",
    ) else {
        return;
    };
    let token = msg.get("token").cloned().unwrap_or_default();
    proxy(
        gateway,
        client,
        manager,
        "slotEndUserSession",
        json!({ "token": token }),
        "projectEndUserSession",
    );
}

pub fn on_save_items(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectSaveItems",
        "Project manager does not exist: Project items cannot be saved.",
    ) else {
        return;
    };
    let args = json!({
        "token": msg.get("token").cloned().unwrap_or_default(),
        "items": msg.get("items").cloned().unwrap_or_else(|| json!([])),
        "client": msg.get("client").cloned().unwrap_or_default(),
    });
    proxy(gateway, client, manager, "slotSaveItems", args, "projectSaveItems");
}

pub fn on_load_items(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectLoadItems",
        "Project manager does not exist: Project items cannot be loaded.",
    ) else {
        return;
    };
    let args = json!({
        "token": msg.get("token").cloned().unwrap_or_default(),
        "items": msg.get("items").cloned().unwrap_or_else(|| json!([])),
    });
    proxy(gateway, client, manager, "slotLoadItems", args, "projectLoadItems");
}

pub fn on_list_project_managers(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>) {
    client.send(
        Priority::Lossless,
        json!({ "type": "projectListProjectManagers", "reply": known_managers(gateway) }),
    );
}

pub fn on_list_items(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectListItems",
        "Project manager does not exist: Project list cannot be retrieved.",
    ) else {
        return;
    };
    let args = json!({
        "token": msg.get("token").cloned().unwrap_or_default(),
        "domain": msg.get("domain").cloned().unwrap_or_default(),
        "item_types": msg.get("item_types").cloned().unwrap_or_else(|| json!([])),
    });
    proxy(gateway, client, manager, "slotListItems", args, "projectListItems");
}

pub fn on_list_domains(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectListDomains",
        "Project manager does not exist: Domain list cannot be retrieved.",
    ) else {
        return;
    };
    let token = msg.get("token").cloned().unwrap_or_default();
    proxy(
        gateway,
        client,
        manager,
        "slotListDomains",
        json!({ "token": token }),
        "projectListDomains",
    );
}

pub fn on_update_attribute(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, msg: Value) {
    let Some(manager) = checked_manager(
        gateway,
        client,
        &msg,
        "projectUpdateAttribute",
        "Project manager does not exist: Cannot update project attribute.",
    ) else {
        return;
    };
    let args = json!({
        "token": msg.get("token").cloned().unwrap_or_default(),
        "items": msg.get("items").cloned().unwrap_or_else(|| json!([])),
    });
    proxy(gateway, client, manager, "slotUpdateAttribute", args, "projectUpdateAttribute");
}
