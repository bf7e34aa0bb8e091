// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Instance-change throttler: coalesces new/update/gone instance events and
//! dispatches them to a handler in cycles.
//!
//! Redundant sequences are removed at submit time: a gone cancels earlier
//! new/update entries for the same instance, a new supersedes an earlier
//! update, and consecutive updates fold their payloads. Each batch is encoded
//! as a three-level object `kind -> instance type -> instance id -> payload`;
//! all three kind keys are present in every batch, empty or not.
//!
//! A cycle fires when the interval elapses or when the buffered change count
//! reaches `max_per_cycle`, whichever comes first. Dispatch always *takes*
//! the buffer under its mutex, so a racing timer tick and threshold trigger
//! cannot double-dispatch: the loser finds an empty buffer and does nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::state::lock;

/// Receives one encoded batch per non-empty cycle. Errors are logged and the
/// next cycle is still armed.
pub type ChangeHandler = Box<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    New,
    Update,
    Gone,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Update => "update",
            Self::Gone => "gone",
        }
    }
}

type InstanceKey = (String, String); // (instance type, instance id)

/// The coalescing buffer for one cycle. Three parallel maps keyed by
/// `(instance type, instance id)` plus the total entry count.
#[derive(Default)]
pub(crate) struct ChangeBuffer {
    new: HashMap<InstanceKey, Value>,
    update: HashMap<InstanceKey, Value>,
    gone: HashMap<InstanceKey, Value>,
    total: usize,
}

impl ChangeBuffer {
    pub(crate) fn total(&self) -> usize {
        self.total
    }

    pub(crate) fn submit_new(&mut self, instance_id: &str, instance_type: &str, info: Value) {
        let key = (instance_type.to_owned(), instance_id.to_owned());
        // An update followed by a new is removed.
        if self.update.remove(&key).is_some() {
            self.total -= 1;
        }
        self.add_change(ChangeKind::New, key, info);
    }

    pub(crate) fn submit_update(&mut self, instance_id: &str, instance_type: &str, info: Value) {
        let key = (instance_type.to_owned(), instance_id.to_owned());
        if let Some(existing) = self.new.get_mut(&key) {
            // A new followed by an update stays a new with the update payload
            // folded in. The counter is unchanged.
            merge_payload(existing, info);
        } else if let Some(existing) = self.update.get_mut(&key) {
            merge_payload(existing, info);
        } else if self.gone.contains_key(&key) {
            // The instance is gone as far as this cycle is concerned; a late
            // update must not resurrect it.
            tracing::debug!(
                instance_type = %key.0,
                instance_id = %key.1,
                "dropping update for an instance already marked gone"
            );
        } else {
            self.add_change(ChangeKind::Update, key, info);
        }
    }

    pub(crate) fn submit_gone(&mut self, instance_id: &str, instance_type: &str, info: Value) {
        let key = (instance_type.to_owned(), instance_id.to_owned());
        let had_new = self.new.remove(&key).is_some();
        if had_new {
            self.total -= 1;
        }
        if self.update.remove(&key).is_some() {
            self.total -= 1;
        }
        // A new followed by a gone cancels out entirely; the gone is recorded
        // only when the instance was already visible before this cycle.
        if !had_new {
            self.add_change(ChangeKind::Gone, key, info);
        }
    }

    fn add_change(&mut self, kind: ChangeKind, key: InstanceKey, info: Value) {
        let map = match kind {
            ChangeKind::New => &mut self.new,
            ChangeKind::Update => &mut self.update,
            ChangeKind::Gone => &mut self.gone,
        };
        if map.contains_key(&key) {
            // The submit-time coalescing should make this unreachable; do not
            // overwrite whatever is already recorded.
            tracing::warn!(
                kind = kind.as_str(),
                instance_type = %key.0,
                instance_id = %key.1,
                "unexpected collision in change buffer, keeping existing entry"
            );
            return;
        }
        map.insert(key, info);
        self.total += 1;
    }

    /// Encode into the wire layout and reset.
    fn take_encoded(&mut self) -> Option<Value> {
        if self.total == 0 {
            return None;
        }
        let buffer = std::mem::take(self);
        Some(json!({
            "new": encode_level(buffer.new),
            "update": encode_level(buffer.update),
            "gone": encode_level(buffer.gone),
        }))
    }
}

fn encode_level(entries: HashMap<InstanceKey, Value>) -> Value {
    let mut root = Map::new();
    for ((instance_type, instance_id), payload) in entries {
        let level = root
            .entry(instance_type)
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(level) = level.as_object_mut() {
            level.insert(instance_id, payload);
        }
    }
    Value::Object(root)
}

/// Fold `incoming` object keys over `existing`; non-object payloads replace.
fn merge_payload(existing: &mut Value, incoming: Value) {
    match (existing.as_object_mut(), incoming) {
        (Some(existing), Value::Object(incoming)) => {
            for (key, value) in incoming {
                existing.insert(key, value);
            }
        }
        (_, incoming) => *existing = incoming,
    }
}

struct ThrottlerInner {
    buffer: Mutex<ChangeBuffer>,
    handler: ChangeHandler,
    max_per_cycle: usize,
    /// Signalled after an out-of-band dispatch so the cycle task restarts its
    /// interval instead of firing a stale tick.
    rearm: Notify,
}

impl ThrottlerInner {
    fn dispatch(&self) {
        let batch = lock(&self.buffer).take_encoded();
        if let Some(batch) = batch {
            if let Err(e) = (self.handler)(batch) {
                tracing::warn!(err = %e, "instance-change handler failed, next cycle still armed");
            }
        }
    }
}

/// Time-and-count bounded dispatcher of coalesced instance changes.
pub struct Throttler {
    inner: Arc<ThrottlerInner>,
    cancel: CancellationToken,
}

impl Throttler {
    pub fn new(cycle_interval: Duration, max_per_cycle: usize, handler: ChangeHandler) -> Self {
        let inner = Arc::new(ThrottlerInner {
            buffer: Mutex::new(ChangeBuffer::default()),
            handler,
            max_per_cycle: max_per_cycle.max(1),
            rearm: Notify::new(),
        });
        let cancel = CancellationToken::new();
        spawn_cycle_task(Arc::downgrade(&inner), cancel.clone(), cycle_interval);
        Self { inner, cancel }
    }

    pub fn submit_new(&self, instance_id: &str, instance_type: &str, info: Value) {
        let fire = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.submit_new(instance_id, instance_type, info);
            buffer.total() >= self.inner.max_per_cycle
        };
        if fire {
            self.flush();
        }
    }

    pub fn submit_update(&self, instance_id: &str, instance_type: &str, info: Value) {
        let fire = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.submit_update(instance_id, instance_type, info);
            buffer.total() >= self.inner.max_per_cycle
        };
        if fire {
            self.flush();
        }
    }

    pub fn submit_gone(&self, instance_id: &str, instance_type: &str, info: Value) {
        let fire = {
            let mut buffer = lock(&self.inner.buffer);
            buffer.submit_gone(instance_id, instance_type, info);
            buffer.total() >= self.inner.max_per_cycle
        };
        if fire {
            self.flush();
        }
    }

    /// Dispatch whatever is buffered right now and arm the next cycle.
    pub fn flush(&self) {
        self.inner.dispatch();
        self.inner.rearm.notify_one();
    }
}

impl Drop for Throttler {
    fn drop(&mut self) {
        self.cancel.cancel();
        // Final flush without re-arming. The cycle task may race this, but
        // dispatch takes the buffer, so pending changes go out exactly once.
        self.inner.dispatch();
    }
}

fn spawn_cycle_task(
    inner: Weak<ThrottlerInner>,
    cancel: CancellationToken,
    cycle_interval: Duration,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(cycle_interval) => {
                    let Some(inner) = inner.upgrade() else { break };
                    inner.dispatch();
                }
                _ = async {
                    match inner.upgrade() {
                        Some(inner) => inner.rearm.notified().await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    // Out-of-band dispatch happened; restart the interval.
                }
            }
        }
    });
}

#[cfg(test)]
#[path = "throttler_tests.rs"]
mod tests;
