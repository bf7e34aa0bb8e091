// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-fabric seam: the [`RemoteClient`] trait the gateway core talks to,
//! and its NATS-backed production implementation.
//!
//! The gateway never touches the broker directly; everything upstream goes
//! through an injected `Arc<dyn RemoteClient>`. Fabric-originated traffic
//! (topology changes, device updates, schemas, pipeline data, logs, alarms)
//! arrives as [`RemoteEvent`]s on a broadcast stream consumed by the event
//! pump.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::state::lock;

/// Applied when neither the client nor the gateway installs an explicit
/// timeout on a slot request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(240);

/// Failure of an upstream slot call.
#[derive(Debug, Clone)]
pub enum RemoteError {
    /// No answer arrived within the effective timeout.
    Timeout { waited: Duration },
    /// The remote side answered with an error.
    Remote(String),
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { waited } => {
                write!(f, "request not answered within {} seconds", waited.as_secs())
            }
            Self::Remote(message) => f.write_str(message),
        }
    }
}

impl std::error::Error for RemoteError {}

/// Fabric-originated event delivered to the gateway core.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    InstanceNew { instance_id: String, instance_type: String, info: Value },
    InstanceUpdated { instance_id: String, instance_type: String, info: Value },
    InstanceGone { instance_id: String, instance_type: String, info: Value },
    /// Batched per-device configuration deltas, `device id -> delta`.
    DevicesChanged { updates: Value },
    SchemaUpdated { device_id: String, schema: Value },
    ClassSchema { server_id: String, class_id: String, schema: Value },
    /// `logger device id -> reader server` map.
    LoggerMap { map: Value },
    PipelineData { channel_name: String, data: Value, timestamp: f64 },
    AlarmUpdate { instance_id: String, update_type: String, rows: Value },
    ProjectUpdate { info: Value },
    LogMessages { messages: Vec<Value> },
}

/// Upstream subscription parameters for one producer channel.
#[derive(Debug, Clone)]
pub struct PipelineMonitorConfig {
    pub distribution: &'static str,
    pub on_slowness: &'static str,
    pub delay: Duration,
}

/// Control message telling a producer how to feed this gateway.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineCtl<'a> {
    subscribe: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    distribution: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    on_slowness: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delay_ms: Option<u64>,
}

impl PipelineMonitorConfig {
    pub fn lossy(delay: Duration) -> Self {
        Self { distribution: "copy", on_slowness: "drop", delay }
    }
}

#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fire-and-forget slot invocation.
    async fn call(&self, instance_id: &str, slot: &str, args: Value) -> Result<(), RemoteError>;

    /// Slot request with a reply. `timeout: None` leaves the fabric default
    /// in place (devices of ignore-timeout classes are called this way).
    async fn request(
        &self,
        instance_id: &str,
        slot: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteError>;

    async fn register_device_monitor(&self, device_id: &str);
    async fn unregister_device_monitor(&self, device_id: &str);

    /// Returns false if the channel was already monitored.
    async fn register_pipeline_monitor(
        &self,
        channel_name: &str,
        config: PipelineMonitorConfig,
    ) -> bool;

    /// Returns false if the channel was not monitored.
    async fn unregister_pipeline_monitor(&self, channel_name: &str) -> bool;

    async fn system_topology(&self) -> Value;
    async fn cached_configuration(&self, device_id: &str) -> Option<Value>;
    async fn cached_device_schema(&self, device_id: &str) -> Option<Value>;
    async fn cached_class_schema(&self, server_id: &str, class_id: &str) -> Option<Value>;

    /// Publish observable gateway state (client count, traffic counters).
    async fn publish_status(&self, status: Value) -> Result<(), RemoteError>;
    /// Publish a client-reported problem on the debug subject.
    async fn publish_debug(&self, info: Value) -> Result<(), RemoteError>;

    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent>;

    /// Bytes read/written over pipeline subscriptions since the last call.
    async fn pipeline_traffic(&self) -> (u64, u64);
}

// -- NATS implementation ------------------------------------------------------

pub struct NatsRemote {
    client: async_nats::Client,
    prefix: String,
    events: broadcast::Sender<RemoteEvent>,
    cancel: CancellationToken,
    topology: Arc<Mutex<Map<String, Value>>>,
    configurations: Arc<Mutex<HashMap<String, Value>>>,
    device_schemas: Arc<Mutex<HashMap<String, Value>>>,
    class_schemas: Arc<Mutex<HashMap<(String, String), Value>>>,
    /// Deltas accumulated between `DevicesChanged` flushes.
    pending_updates: Arc<Mutex<Map<String, Value>>>,
    device_monitors: Mutex<HashMap<String, AbortHandle>>,
    pipeline_monitors: Mutex<HashMap<String, AbortHandle>>,
    pipeline_bytes_read: Arc<AtomicU64>,
    pipeline_bytes_written: AtomicU64,
}

impl NatsRemote {
    pub async fn connect(config: &GatewayConfig, cancel: CancellationToken) -> anyhow::Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(config.gateway_id.clone())
            .request_timeout(None)
            .connect(&config.nats_url)
            .await?;
        tracing::info!(url = %config.nats_url, prefix = %config.subject_prefix, "fabric connected");

        let (events, _) = broadcast::channel(1024);
        let remote = Self {
            client,
            prefix: config.subject_prefix.clone(),
            events,
            cancel,
            topology: Arc::new(Mutex::new(Map::new())),
            configurations: Arc::new(Mutex::new(HashMap::new())),
            device_schemas: Arc::new(Mutex::new(HashMap::new())),
            class_schemas: Arc::new(Mutex::new(HashMap::new())),
            pending_updates: Arc::new(Mutex::new(Map::new())),
            device_monitors: Mutex::new(HashMap::new()),
            pipeline_monitors: Mutex::new(HashMap::new()),
            pipeline_bytes_read: Arc::new(AtomicU64::new(0)),
            pipeline_bytes_written: AtomicU64::new(0),
        };

        remote.fetch_initial_topology().await;
        remote.spawn_core_subscriber().await?;
        remote.spawn_update_flusher(config.property_update_interval());
        Ok(remote)
    }

    fn subject(&self, tail: &str) -> String {
        format!("{}.{tail}", self.prefix)
    }

    async fn fetch_initial_topology(&self) {
        let request = self
            .client
            .request(self.subject("topology"), Bytes::new());
        match tokio::time::timeout(Duration::from_secs(5), request).await {
            Ok(Ok(reply)) => {
                if let Ok(Value::Object(topology)) = serde_json::from_slice(&reply.payload) {
                    *lock(&self.topology) = topology;
                }
            }
            Ok(Err(e)) => tracing::warn!(err = %e, "topology snapshot request failed"),
            Err(_) => tracing::warn!("topology snapshot request timed out"),
        }
    }

    /// Subscribe the always-on fabric subjects and pump them into the event
    /// stream. async-nats re-establishes these subscriptions itself after a
    /// connection drop.
    async fn spawn_core_subscriber(&self) -> anyhow::Result<()> {
        let mut subscriptions = Vec::new();
        for tail in ["topology.>", "schema.>", "alarm.>", "project.update", "log", "loggermap"] {
            subscriptions.push(self.client.subscribe(self.subject(tail)).await?);
        }
        let mut stream = futures_util::stream::select_all(subscriptions);

        let prefix = self.prefix.clone();
        let events = self.events.clone();
        let topology = Arc::clone(&self.topology);
        let device_schemas = Arc::clone(&self.device_schemas);
        let class_schemas = Arc::clone(&self.class_schemas);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = stream.next() => {
                        let Some(msg) = msg else { break };
                        let Some(tail) = msg.subject.as_str().strip_prefix(&prefix) else {
                            continue;
                        };
                        let tail = tail.strip_prefix('.').unwrap_or(tail);
                        let payload: Value = match serde_json::from_slice(&msg.payload) {
                            Ok(value) => value,
                            Err(e) => {
                                tracing::debug!(subject = %msg.subject, err = %e, "undecodable fabric message");
                                continue;
                            }
                        };
                        if let Some(event) = parse_fabric_message(tail, payload, &topology) {
                            match &event {
                                RemoteEvent::SchemaUpdated { device_id, schema } => {
                                    lock(&device_schemas)
                                        .insert(device_id.clone(), schema.clone());
                                }
                                RemoteEvent::ClassSchema { server_id, class_id, schema } => {
                                    lock(&class_schemas).insert(
                                        (server_id.clone(), class_id.clone()),
                                        schema.clone(),
                                    );
                                }
                                _ => {}
                            }
                            let _ = events.send(event);
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Flush accumulated per-device deltas as one `DevicesChanged` batch per
    /// interval, shielding clients from too frequent single-property updates.
    fn spawn_update_flusher(&self, interval: Duration) {
        let pending = Arc::clone(&self.pending_updates);
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval.max(Duration::from_millis(1)));
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = timer.tick() => {}
                }
                let updates = std::mem::take(&mut *lock(&pending));
                if !updates.is_empty() {
                    let _ = events.send(RemoteEvent::DevicesChanged { updates: Value::Object(updates) });
                }
            }
        });
    }
}

/// Payload of a `topology.new|update|gone` fabric message.
#[derive(Debug, Deserialize)]
struct TopologyChange {
    #[serde(rename = "instanceId")]
    instance_id: String,
    #[serde(rename = "type")]
    instance_type: String,
    #[serde(default = "empty_object")]
    info: Value,
}

fn empty_object() -> Value {
    json!({})
}

/// Map one fabric message to an event, updating the topology cache.
fn parse_fabric_message(
    tail: &str,
    payload: Value,
    topology: &Mutex<Map<String, Value>>,
) -> Option<RemoteEvent> {
    let segments: Vec<&str> = tail.split('.').collect();
    match segments.as_slice() {
        ["topology", change] => {
            let TopologyChange { instance_id, instance_type, info } =
                serde_json::from_value(payload).ok()?;
            match *change {
                "new" | "update" => {
                    let mut topology = lock(topology);
                    let level = topology
                        .entry(instance_type.clone())
                        .or_insert_with(|| Value::Object(Map::new()));
                    if let Some(level) = level.as_object_mut() {
                        level.insert(instance_id.clone(), info.clone());
                    }
                    drop(topology);
                    if *change == "new" {
                        Some(RemoteEvent::InstanceNew { instance_id, instance_type, info })
                    } else {
                        Some(RemoteEvent::InstanceUpdated { instance_id, instance_type, info })
                    }
                }
                "gone" => {
                    let mut topology = lock(topology);
                    if let Some(level) =
                        topology.get_mut(&instance_type).and_then(Value::as_object_mut)
                    {
                        level.remove(&instance_id);
                    }
                    drop(topology);
                    Some(RemoteEvent::InstanceGone { instance_id, instance_type, info })
                }
                _ => None,
            }
        }
        ["schema", "device", device_id] => Some(RemoteEvent::SchemaUpdated {
            device_id: (*device_id).to_owned(),
            schema: payload,
        }),
        ["schema", "class", server_id, class_id] => Some(RemoteEvent::ClassSchema {
            server_id: (*server_id).to_owned(),
            class_id: (*class_id).to_owned(),
            schema: payload,
        }),
        ["alarm", "update"] => Some(RemoteEvent::AlarmUpdate {
            instance_id: payload.get("instanceId")?.as_str()?.to_owned(),
            update_type: payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("alarmUpdate")
                .to_owned(),
            rows: payload.get("rows").cloned().unwrap_or_else(|| json!({})),
        }),
        ["project", "update"] => Some(RemoteEvent::ProjectUpdate {
            info: payload.get("info").cloned().unwrap_or(payload),
        }),
        ["log"] => Some(RemoteEvent::LogMessages {
            messages: payload
                .get("messages")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default(),
        }),
        ["loggermap"] => Some(RemoteEvent::LoggerMap {
            map: payload.get("map").cloned().unwrap_or(payload),
        }),
        _ => {
            tracing::trace!(subject_tail = tail, "unhandled fabric subject");
            None
        }
    }
}

#[async_trait]
impl RemoteClient for NatsRemote {
    async fn call(&self, instance_id: &str, slot: &str, args: Value) -> Result<(), RemoteError> {
        let payload = serde_json::to_vec(&args).unwrap_or_default();
        self.client
            .publish(self.subject(&format!("slot.{instance_id}.{slot}")), payload.into())
            .await
            .map_err(|e| RemoteError::Remote(e.to_string()))
    }

    async fn request(
        &self,
        instance_id: &str,
        slot: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteError> {
        let waited = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let payload = serde_json::to_vec(&args).unwrap_or_default();
        let request = self
            .client
            .request(self.subject(&format!("slot.{instance_id}.{slot}")), payload.into());
        let reply = tokio::time::timeout(waited, request)
            .await
            .map_err(|_| RemoteError::Timeout { waited })?
            .map_err(|e| RemoteError::Remote(e.to_string()))?;
        let value: Value = serde_json::from_slice(&reply.payload)
            .map_err(|e| RemoteError::Remote(format!("undecodable reply: {e}")))?;
        if let Some(error) = value.get("error").and_then(Value::as_str) {
            return Err(RemoteError::Remote(error.to_owned()));
        }
        Ok(value)
    }

    async fn register_device_monitor(&self, device_id: &str) {
        if lock(&self.device_monitors).contains_key(device_id) {
            return;
        }
        let subscriber = match self
            .client
            .subscribe(self.subject(&format!("device.{device_id}.update")))
            .await
        {
            Ok(subscriber) => subscriber,
            Err(e) => {
                tracing::warn!(device_id, err = %e, "device monitor subscription failed");
                return;
            }
        };
        let device_id_owned = device_id.to_owned();
        let pending = Arc::clone(&self.pending_updates);
        let configurations = Arc::clone(&self.configurations);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut subscriber = subscriber;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        let Ok(delta) = serde_json::from_slice::<Value>(&msg.payload) else {
                            continue;
                        };
                        {
                            let mut configurations = lock(&configurations);
                            let entry = configurations
                                .entry(device_id_owned.clone())
                                .or_insert_with(|| json!({}));
                            merge_object(entry, &delta);
                        }
                        let mut pending = lock(&pending);
                        let entry = pending
                            .entry(device_id_owned.clone())
                            .or_insert_with(|| json!({}));
                        merge_object(entry, &delta);
                    }
                }
            }
        });
        lock(&self.device_monitors).insert(device_id.to_owned(), task.abort_handle());

        // Ask for the full configuration once so the cache warms up; the
        // answer flows back through the update subject like any delta.
        let _ = self
            .call(device_id, "slotGetConfiguration", json!({}))
            .await;
    }

    async fn unregister_device_monitor(&self, device_id: &str) {
        if let Some(handle) = lock(&self.device_monitors).remove(device_id) {
            handle.abort();
        }
        lock(&self.configurations).remove(device_id);
    }

    async fn register_pipeline_monitor(
        &self,
        channel_name: &str,
        config: PipelineMonitorConfig,
    ) -> bool {
        if lock(&self.pipeline_monitors).contains_key(channel_name) {
            return false;
        }
        let subscriber = match self
            .client
            .subscribe(self.subject(&format!("pipeline.{channel_name}.data")))
            .await
        {
            Ok(subscriber) => subscriber,
            Err(e) => {
                tracing::warn!(channel_name, err = %e, "pipeline subscription failed");
                return false;
            }
        };

        let ctl = PipelineCtl {
            subscribe: true,
            distribution: Some(config.distribution),
            on_slowness: Some(config.on_slowness),
            delay_ms: Some(config.delay.as_millis() as u64),
        };
        let ctl_bytes = serde_json::to_vec(&ctl).unwrap_or_default();
        self.pipeline_bytes_written
            .fetch_add(ctl_bytes.len() as u64, Ordering::Relaxed);
        if let Err(e) = self
            .client
            .publish(self.subject(&format!("pipeline.{channel_name}.ctl")), ctl_bytes.into())
            .await
        {
            tracing::warn!(channel_name, err = %e, "pipeline subscribe control failed");
        }

        let channel = channel_name.to_owned();
        let events = self.events.clone();
        let bytes_read = Arc::clone(&self.pipeline_bytes_read);
        let cancel = self.cancel.clone();
        let task = tokio::spawn(async move {
            let mut subscriber = subscriber;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = subscriber.next() => {
                        let Some(msg) = msg else { break };
                        bytes_read.fetch_add(msg.payload.len() as u64, Ordering::Relaxed);
                        let Ok(payload) = serde_json::from_slice::<Value>(&msg.payload) else {
                            continue;
                        };
                        let timestamp = payload
                            .get("timestamp")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0);
                        let data = payload.get("data").cloned().unwrap_or(payload);
                        let _ = events.send(RemoteEvent::PipelineData {
                            channel_name: channel.clone(),
                            data,
                            timestamp,
                        });
                    }
                }
            }
        });
        lock(&self.pipeline_monitors).insert(channel_name.to_owned(), task.abort_handle());
        true
    }

    async fn unregister_pipeline_monitor(&self, channel_name: &str) -> bool {
        let Some(handle) = lock(&self.pipeline_monitors).remove(channel_name) else {
            return false;
        };
        handle.abort();
        let ctl = PipelineCtl {
            subscribe: false,
            distribution: None,
            on_slowness: None,
            delay_ms: None,
        };
        let ctl_bytes = serde_json::to_vec(&ctl).unwrap_or_default();
        if let Err(e) = self
            .client
            .publish(self.subject(&format!("pipeline.{channel_name}.ctl")), ctl_bytes.into())
            .await
        {
            tracing::debug!(channel_name, err = %e, "pipeline unsubscribe control failed");
        }
        true
    }

    async fn system_topology(&self) -> Value {
        Value::Object(lock(&self.topology).clone())
    }

    async fn cached_configuration(&self, device_id: &str) -> Option<Value> {
        lock(&self.configurations).get(device_id).cloned()
    }

    async fn cached_device_schema(&self, device_id: &str) -> Option<Value> {
        if let Some(schema) = lock(&self.device_schemas).get(device_id) {
            return Some(schema.clone());
        }
        let request = serde_json::to_vec(&json!({ "deviceId": device_id })).unwrap_or_default();
        let _ = self.client.publish(self.subject("schema.request"), request.into()).await;
        None
    }

    async fn cached_class_schema(&self, server_id: &str, class_id: &str) -> Option<Value> {
        let key = (server_id.to_owned(), class_id.to_owned());
        if let Some(schema) = lock(&self.class_schemas).get(&key) {
            return Some(schema.clone());
        }
        let request = serde_json::to_vec(&json!({ "serverId": server_id, "classId": class_id }))
            .unwrap_or_default();
        let _ = self.client.publish(self.subject("schema.request"), request.into()).await;
        None
    }

    async fn publish_status(&self, status: Value) -> Result<(), RemoteError> {
        let payload = serde_json::to_vec(&status).unwrap_or_default();
        self.client
            .publish(self.subject("gateway.status"), payload.into())
            .await
            .map_err(|e| RemoteError::Remote(e.to_string()))
    }

    async fn publish_debug(&self, info: Value) -> Result<(), RemoteError> {
        let payload = serde_json::to_vec(&info).unwrap_or_default();
        self.client
            .publish(self.subject("gateway.debug"), payload.into())
            .await
            .map_err(|e| RemoteError::Remote(e.to_string()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    async fn pipeline_traffic(&self) -> (u64, u64) {
        (
            self.pipeline_bytes_read.swap(0, Ordering::Relaxed),
            self.pipeline_bytes_written.swap(0, Ordering::Relaxed),
        )
    }
}

/// Fold the keys of `delta` over `target`; non-object deltas replace.
fn merge_object(target: &mut Value, delta: &Value) {
    match (target.as_object_mut(), delta.as_object()) {
        (Some(target), Some(delta)) => {
            for (key, value) in delta {
                target.insert(key.clone(), value.clone());
            }
        }
        _ => *target = delta.clone(),
    }
}
