// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Client registry operations: registration, the channel-lost cleanup path,
//! and whole-registry queries.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use crate::error::FailureKind;
use crate::state::{lock, read_lock, write_lock, ClientHandle, Gateway};

impl Gateway {
    /// Add a freshly logged-in client and republish the connected count.
    pub fn register_client(self: &Arc<Self>, client: Arc<ClientHandle>) {
        let count = {
            let mut clients = write_lock(&self.clients);
            clients.insert(client.id, client);
            clients.len()
        };
        self.publish_client_count(count);
    }

    /// Union of every connected client's visible devices.
    pub fn visibility_union(&self) -> HashSet<String> {
        let clients = read_lock(&self.clients);
        let mut union = HashSet::new();
        for client in clients.values() {
            union.extend(lock(&client.record).visible_instances.iter().cloned());
        }
        union
    }

    pub fn for_each_client(&self, mut f: impl FnMut(&Arc<ClientHandle>)) {
        let clients = read_lock(&self.clients);
        for client in clients.values() {
            f(client);
        }
    }

    /// Full cleanup after a client socket died or was closed on purpose.
    ///
    /// Lock order: clients -> monitors -> pipelines. Upstream unsubscriptions
    /// are collected under the locks and performed afterwards.
    pub fn on_client_error(self: &Arc<Self>, client: &Arc<ClientHandle>) {
        {
            let record = lock(&client.record);
            // Authenticated sessions keep the user id out of local logs.
            let user = if record.one_time_token.is_some() { "<authenticated>" } else { record.user_id.as_str() };
            tracing::info!(
                client_id = client.id,
                kind = %FailureKind::ChannelLost,
                user,
                session_secs = record.session_start.elapsed().as_secs(),
                dropped = client.queues.dropped(),
                "client connection closed, cleaning up"
            );
        }
        client.cancel.cancel();
        client.queues.close();

        let count = {
            let mut clients = write_lock(&self.clients);
            clients.remove(&client.id);
            clients.len()
        };

        // Devices only this client was watching lose their upstream monitor.
        let visible = std::mem::take(&mut lock(&client.record).visible_instances);
        let mut released_devices = Vec::new();
        {
            let mut monitors = lock(&self.monitors);
            for device_id in &visible {
                if let Some(refcount) = monitors.get_mut(device_id) {
                    *refcount = refcount.saturating_sub(1);
                    if *refcount == 0 {
                        monitors.remove(device_id);
                        released_devices.push(device_id.clone());
                    }
                }
            }
        }

        // Producer channels nobody watches any more release their upstream
        // subscription.
        let mut released_pipelines = Vec::new();
        {
            let mut pipelines = lock(&self.pipelines);
            pipelines.retain(|channel_name, subscribers| {
                subscribers.remove(&client.id);
                if subscribers.is_empty() {
                    released_pipelines.push(channel_name.clone());
                    false
                } else {
                    true
                }
            });
        }

        tracing::info!(
            clients_left = count,
            devices_released = released_devices.len(),
            pipelines_released = released_pipelines.len(),
            "client state removed"
        );

        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            for device_id in released_devices {
                gateway.remote.unregister_device_monitor(&device_id).await;
            }
            for channel_name in released_pipelines {
                if !gateway.remote.unregister_pipeline_monitor(&channel_name).await {
                    tracing::warn!(channel_name, "pipeline was not monitored upstream");
                }
            }
        });

        self.publish_client_count(count);
    }

    fn publish_client_count(self: &Arc<Self>, count: usize) {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = gateway
                .remote
                .publish_status(json!({ "connectedClientCount": count }))
                .await
            {
                tracing::debug!(err = %e, "client count publish failed");
            }
        });
    }
}
