// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test support: a scriptable in-memory fabric and gateway/client fixtures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::logfwd::ForwardLevel;
use crate::remote::{PipelineMonitorConfig, RemoteClient, RemoteError, RemoteEvent};
use crate::state::{lock, ClientHandle, ClientRecord, Gateway};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub instance_id: String,
    pub slot: String,
    pub args: Value,
    pub timeout: Option<Duration>,
}

/// Fabric double: records every outbound interaction and replays scripted
/// responses; events are pushed by the test through [`MockRemote::emit`].
pub struct MockRemote {
    pub calls: Mutex<Vec<(String, String, Value)>>,
    pub requests: Mutex<Vec<RecordedRequest>>,
    /// Responses popped per request, in order; `Ok({})` once exhausted.
    pub responses: Mutex<VecDeque<Result<Value, RemoteError>>>,
    pub device_monitors: Mutex<HashSet<String>>,
    pub device_monitor_log: Mutex<Vec<String>>,
    pub pipeline_monitors: Mutex<HashSet<String>>,
    pub configurations: Mutex<HashMap<String, Value>>,
    pub device_schemas: Mutex<HashMap<String, Value>>,
    pub class_schemas: Mutex<HashMap<(String, String), Value>>,
    pub status: Mutex<Vec<Value>>,
    /// Every `publish_status` attempt, including refused ones.
    pub status_attempts: AtomicU64,
    /// When set, `publish_status` answers with a remote error.
    pub fail_status: AtomicBool,
    pub debug: Mutex<Vec<Value>>,
    pub topology: Mutex<Value>,
    events: broadcast::Sender<RemoteEvent>,
}

impl MockRemote {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            calls: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            responses: Mutex::new(VecDeque::new()),
            device_monitors: Mutex::new(HashSet::new()),
            device_monitor_log: Mutex::new(Vec::new()),
            pipeline_monitors: Mutex::new(HashSet::new()),
            configurations: Mutex::new(HashMap::new()),
            device_schemas: Mutex::new(HashMap::new()),
            class_schemas: Mutex::new(HashMap::new()),
            status: Mutex::new(Vec::new()),
            status_attempts: AtomicU64::new(0),
            fail_status: AtomicBool::new(false),
            debug: Mutex::new(Vec::new()),
            topology: Mutex::new(json!({})),
            events,
        }
    }

    pub fn push_response(&self, response: Result<Value, RemoteError>) {
        lock(&self.responses).push_back(response);
    }

    pub fn emit(&self, event: RemoteEvent) {
        let _ = self.events.send(event);
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn call(&self, instance_id: &str, slot: &str, args: Value) -> Result<(), RemoteError> {
        lock(&self.calls).push((instance_id.to_owned(), slot.to_owned(), args));
        Ok(())
    }

    async fn request(
        &self,
        instance_id: &str,
        slot: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RemoteError> {
        lock(&self.requests).push(RecordedRequest {
            instance_id: instance_id.to_owned(),
            slot: slot.to_owned(),
            args,
            timeout,
        });
        lock(&self.responses).pop_front().unwrap_or_else(|| Ok(json!({})))
    }

    async fn register_device_monitor(&self, device_id: &str) {
        lock(&self.device_monitors).insert(device_id.to_owned());
        lock(&self.device_monitor_log).push(device_id.to_owned());
    }

    async fn unregister_device_monitor(&self, device_id: &str) {
        lock(&self.device_monitors).remove(device_id);
    }

    async fn register_pipeline_monitor(
        &self,
        channel_name: &str,
        _config: PipelineMonitorConfig,
    ) -> bool {
        lock(&self.pipeline_monitors).insert(channel_name.to_owned())
    }

    async fn unregister_pipeline_monitor(&self, channel_name: &str) -> bool {
        lock(&self.pipeline_monitors).remove(channel_name)
    }

    async fn system_topology(&self) -> Value {
        lock(&self.topology).clone()
    }

    async fn cached_configuration(&self, device_id: &str) -> Option<Value> {
        lock(&self.configurations).get(device_id).cloned()
    }

    async fn cached_device_schema(&self, device_id: &str) -> Option<Value> {
        lock(&self.device_schemas).get(device_id).cloned()
    }

    async fn cached_class_schema(&self, server_id: &str, class_id: &str) -> Option<Value> {
        lock(&self.class_schemas).get(&(server_id.to_owned(), class_id.to_owned())).cloned()
    }

    async fn publish_status(&self, status: Value) -> Result<(), RemoteError> {
        self.status_attempts.fetch_add(1, Ordering::Relaxed);
        if self.fail_status.load(Ordering::Relaxed) {
            return Err(RemoteError::Remote("status publish refused".to_owned()));
        }
        lock(&self.status).push(status);
        Ok(())
    }

    async fn publish_debug(&self, info: Value) -> Result<(), RemoteError> {
        lock(&self.debug).push(info);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events.subscribe()
    }

    async fn pipeline_traffic(&self) -> (u64, u64) {
        (0, 0)
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        host: "127.0.0.1".to_owned(),
        port: 44444,
        nats_url: "nats://127.0.0.1:4222".to_owned(),
        subject_prefix: "gridlink".to_owned(),
        gateway_id: "GridLink_Gateway_0".to_owned(),
        delay_on_input_ms: 500,
        lossy_data_queue_capacity: 100,
        property_update_interval_ms: 500,
        wait_init_device_ms: 100,
        forward_log_interval_ms: 1000,
        log_forwarding_level: ForwardLevel::Info,
        network_sample_interval_secs: 5,
        heartbeat_interval_secs: 60,
        throttle_interval_ms: 500,
        max_changes_per_cycle: 100,
        min_client_version: "2.10.4".to_owned(),
        read_only: false,
        ignore_timeout_classes: Vec::new(),
        timeout_secs: 10,
        data_log_manager_id: "GridLink_DataLoggerManager".to_owned(),
    }
}

/// Gateway wired to a fresh mock fabric. Needs a tokio runtime (the
/// throttler spawns its cycle task).
pub fn test_gateway_with(config: GatewayConfig) -> (Arc<Gateway>, Arc<MockRemote>) {
    let remote = Arc::new(MockRemote::new());
    let gateway = Gateway::new(config, Arc::clone(&remote) as Arc<dyn RemoteClient>, CancellationToken::new());
    gateway.start();
    (gateway, remote)
}

pub fn test_gateway() -> (Arc<Gateway>, Arc<MockRemote>) {
    test_gateway_with(test_config())
}

/// Register a logged-in client without a socket.
pub fn connect_client(gateway: &Arc<Gateway>) -> Arc<ClientHandle> {
    connect_client_with_version(gateway, semver::Version::new(2, 20, 0))
}

pub fn connect_client_with_version(
    gateway: &Arc<Gateway>,
    version: semver::Version,
) -> Arc<ClientHandle> {
    let record = ClientRecord::new(version, "tester");
    let client = Arc::new(ClientHandle::new(
        gateway.next_client_id(),
        record,
        gateway.config.lossy_data_queue_capacity as usize,
    ));
    gateway.register_client(Arc::clone(&client));
    client
}

/// Pop everything queued for a client, in drain order.
pub fn drain(client: &ClientHandle) -> Vec<Value> {
    let mut messages = Vec::new();
    while let Some(message) = client.queues.pop() {
        messages.push(message);
    }
    messages
}

/// Let spawned continuation tasks run to completion on the test runtime.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
