// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Pipeline multiplexer: one upstream subscription per producer channel,
//! fanned out to subscribed clients under per-client readiness gating.
//!
//! The FAST_DATA lane itself never drops, but the flow as a whole is lossy:
//! a client gets an item only while its readiness flag is set, the flag is
//! cleared on send, and the client re-arms it with `requestNetwork` once it
//! has digested the item. Slow clients therefore skip items instead of
//! backing up the producer.

use std::sync::Arc;

use serde_json::Value;

use crate::messages;
use crate::queue::Priority;
use crate::remote::PipelineMonitorConfig;
use crate::state::{lock, ClientHandle, ClientId, Gateway};

/// Subscribe `client` to a producer channel, opening the single upstream
/// subscription when it is the first one interested.
pub async fn subscribe(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, channel_name: &str) {
    let first = {
        let mut pipelines = lock(&gateway.pipelines);
        let subscribers = pipelines.entry(channel_name.to_owned()).or_default();
        let first = subscribers.is_empty();
        if subscribers.insert(client.id, true).is_some() {
            tracing::warn!(client_id = client.id, channel_name, "duplicate pipeline subscription");
        }
        first
    };

    if first {
        tracing::debug!(channel_name, "registering upstream pipeline monitor");
        let config = PipelineMonitorConfig::lossy(gateway.config.delay_on_input());
        if !gateway.remote.register_pipeline_monitor(channel_name, config).await {
            tracing::warn!(channel_name, "pipeline already monitored upstream");
        }
    }
}

/// Remove `client` from a producer channel, releasing the upstream
/// subscription when nobody is left.
pub async fn unsubscribe(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, channel_name: &str) {
    let released = {
        let mut pipelines = lock(&gateway.pipelines);
        let Some(subscribers) = pipelines.get_mut(channel_name) else {
            tracing::warn!(client_id = client.id, channel_name, "unsubscribe from unknown channel");
            return;
        };
        if subscribers.remove(&client.id).is_none() {
            tracing::warn!(client_id = client.id, channel_name, "unsubscribe without subscription");
        }
        if subscribers.is_empty() {
            pipelines.remove(channel_name);
            true
        } else {
            false
        }
    };

    if released {
        tracing::debug!(channel_name, "releasing upstream pipeline monitor");
        if !gateway.remote.unregister_pipeline_monitor(channel_name).await {
            tracing::warn!(channel_name, "pipeline was not monitored upstream");
        }
    }
}

/// The client signals it has processed the previous item and is ready for the
/// next one.
pub fn request_more(gateway: &Gateway, client: &ClientHandle, channel_name: &str) {
    let mut pipelines = lock(&gateway.pipelines);
    if let Some(ready) = pipelines
        .get_mut(channel_name)
        .and_then(|subscribers| subscribers.get_mut(&client.id))
    {
        *ready = true;
    }
}

/// Forward one pipeline item to every currently-ready subscriber and clear
/// their readiness. Subscribers that are not ready skip the item entirely.
pub fn on_data(gateway: &Gateway, channel_name: &str, data: Value, timestamp: f64) {
    let recipients: Vec<ClientId> = {
        let mut pipelines = lock(&gateway.pipelines);
        let Some(subscribers) = pipelines.get_mut(channel_name) else {
            // All clients lost interest but data is still in flight.
            return;
        };
        subscribers
            .iter_mut()
            .filter_map(|(client_id, ready)| {
                if *ready {
                    *ready = false;
                    Some(*client_id)
                } else {
                    None
                }
            })
            .collect()
    };
    if recipients.is_empty() {
        return;
    }

    let message = messages::network_data(channel_name, data, timestamp);
    for client_id in recipients {
        if let Some(client) = gateway.client(client_id) {
            client.send(Priority::FastData, message.clone());
        }
    }
}

/// Drop every subscription whose producer is the instance that disappeared
/// and release the matching upstream monitors.
pub async fn drop_producer(gateway: &Arc<Gateway>, instance_id: &str) {
    let released: Vec<String> = {
        let mut pipelines = lock(&gateway.pipelines);
        let doomed: Vec<String> = pipelines
            .keys()
            .filter(|channel_name| {
                channel_name.split(':').next().is_some_and(|producer| producer == instance_id)
            })
            .cloned()
            .collect();
        for channel_name in &doomed {
            pipelines.remove(channel_name);
        }
        doomed
    };
    for channel_name in released {
        tracing::debug!(channel_name, "producer gone, releasing pipeline monitor");
        gateway.remote.unregister_pipeline_monitor(&channel_name).await;
    }
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
