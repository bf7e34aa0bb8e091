// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared gateway state.
//!
//! Every mutable table lives on [`Gateway`], shared as `Arc<Gateway>` between
//! the transport, the fabric event pump and the timer tasks. Each table has
//! its own lock, held only for short synchronous sections and never across an
//! await; the client-error cleanup is the one path that takes more than one
//! of them, in the fixed order clients -> monitors -> pipelines.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Instant;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::queue::{OutboundQueues, Priority};
use crate::remote::RemoteClient;
use crate::throttler::{ChangeHandler, Throttler};

/// Acquire a std mutex, recovering the data from a poisoned lock. Tables hold
/// plain data, so a panicking holder leaves nothing half-initialised worth
/// refusing over.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    rwlock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(rwlock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    rwlock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Stable per-session client identity. Allocated from a process-wide counter,
/// never reused, totally ordered; socket addresses are not used as keys.
pub type ClientId = u64;

/// Per-client bookkeeping guarded by the handle's own mutex.
pub struct ClientRecord {
    pub version: semver::Version,
    pub user_id: String,
    /// One-time token of an authenticated session. When present, the user id
    /// stays out of local logs.
    pub one_time_token: Option<String>,
    pub session_start: Instant,
    /// Devices this client currently monitors.
    pub visible_instances: HashSet<String>,
    /// Devices with an outstanding schema request from this client.
    pub requested_device_schemas: HashSet<String>,
    /// Outstanding class-schema requests, `server id -> class ids`.
    pub requested_class_schemas: HashMap<String, HashSet<String>>,
}

impl ClientRecord {
    pub fn new(version: semver::Version, user_id: impl Into<String>) -> Self {
        Self {
            version,
            user_id: user_id.into(),
            one_time_token: None,
            session_start: Instant::now(),
            visible_instances: HashSet::new(),
            requested_device_schemas: HashSet::new(),
            requested_class_schemas: HashMap::new(),
        }
    }
}

/// One logged-in client. The gateway keeps the strong reference; continuation
/// tasks capture a `Weak` and promote it when (and if) the reply arrives.
pub struct ClientHandle {
    pub id: ClientId,
    pub queues: OutboundQueues,
    pub record: Mutex<ClientRecord>,
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    /// Stops the writer task and the read loop for this client only.
    pub cancel: CancellationToken,
}

impl ClientHandle {
    pub fn new(id: ClientId, record: ClientRecord, lossy_capacity: usize) -> Self {
        Self {
            id,
            queues: OutboundQueues::new(lossy_capacity),
            record: Mutex::new(record),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        }
    }

    pub fn send(&self, priority: Priority, message: Value) {
        self.queues.push(priority, message);
    }
}

/// A queued device instantiation, serviced one per timer tick.
pub struct Instantiation {
    pub client: Weak<ClientHandle>,
    pub payload: Value,
}

/// Schema-attribute updates waiting for both the instance announcement and
/// the device-server reply.
pub struct AttributeUpdates {
    pub mask: u8,
    pub updates: Vec<Value>,
}

/// Per-producer pipeline fan-out state: key present means subscribed, value
/// is the client's readiness for the next item.
pub type PipelineSubscribers = BTreeMap<ClientId, bool>;

pub struct Gateway {
    pub config: GatewayConfig,
    pub remote: Arc<dyn RemoteClient>,
    pub shutdown: CancellationToken,

    pub clients: RwLock<HashMap<ClientId, Arc<ClientHandle>>>,
    next_client_id: AtomicU64,

    /// Device monitor reference counts.
    pub monitors: Mutex<HashMap<String, usize>>,
    /// Pipeline fan-out per producer channel (`producerId:channelName`).
    pub pipelines: Mutex<HashMap<String, PipelineSubscribers>>,
    pub pending_instantiations: Mutex<VecDeque<Instantiation>>,
    pub pending_attributes: Mutex<HashMap<String, AttributeUpdates>>,
    /// `logger device id -> reader server`, fed by the fabric.
    pub logger_map: Mutex<HashMap<String, String>>,
    pub reader_round_robin: AtomicUsize,
    pub project_managers: RwLock<HashSet<String>>,
    /// Devices whose classes are on the ignore-timeout list.
    pub timing_out_devices: Mutex<HashSet<String>>,
    /// Log records accumulated between forwarding cycles.
    pub log_cache: Mutex<Vec<Value>>,

    throttler: OnceLock<Throttler>,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        remote: Arc<dyn RemoteClient>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            remote,
            shutdown,
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            monitors: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
            pending_instantiations: Mutex::new(VecDeque::new()),
            pending_attributes: Mutex::new(HashMap::new()),
            logger_map: Mutex::new(HashMap::new()),
            reader_round_robin: AtomicUsize::new(0),
            project_managers: RwLock::new(HashSet::new()),
            timing_out_devices: Mutex::new(HashSet::new()),
            log_cache: Mutex::new(Vec::new()),
            throttler: OnceLock::new(),
        })
    }

    /// Install the topology throttler. Separate from `new` because the
    /// dispatch handler captures a weak reference back to the gateway.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let handler: ChangeHandler = Box::new(move |changes| {
            let Some(gateway) = weak.upgrade() else {
                return Ok(());
            };
            gateway.broadcast(crate::messages::topology_update(changes), Priority::Lossless);
            Ok(())
        });
        let throttler = Throttler::new(
            self.config.throttle_interval(),
            self.config.max_changes_per_cycle as usize,
            handler,
        );
        if self.throttler.set(throttler).is_err() {
            tracing::warn!(
                kind = %crate::error::FailureKind::Internal,
                "throttler installed twice, keeping the first one"
            );
        }
    }

    pub fn throttler(&self) -> Option<&Throttler> {
        self.throttler.get()
    }

    /// Dispatch pending topology changes right now. Used to order alarm
    /// messages after any instance changes they refer to.
    pub fn flush_topology_changes(&self) {
        if let Some(throttler) = self.throttler.get() {
            throttler.flush();
        }
    }

    pub fn next_client_id(&self) -> ClientId {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn client(&self, id: ClientId) -> Option<Arc<ClientHandle>> {
        read_lock(&self.clients).get(&id).map(Arc::clone)
    }

    /// Enqueue one message to every connected client.
    pub fn broadcast(&self, message: Value, priority: Priority) {
        let clients = read_lock(&self.clients);
        for client in clients.values() {
            client.send(priority, message.clone());
        }
    }

    pub fn is_timing_out(&self, device_id: &str) -> bool {
        lock(&self.timing_out_devices).contains(device_id)
    }
}
