// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client outbound lanes with differentiated drop policies.
//!
//! Three lanes per client socket:
//! - `Lossless` for control-plane replies, topology and notifications;
//! - `RemoveOldest` for bulky history and log batches, a bounded ring that
//!   drops its oldest entry on overflow;
//! - `FastData` for pipeline payloads. The lane itself is lossless; it is
//!   filled only while the client has signalled readiness, so it never grows
//!   past the number of pipelines the client watches.
//!
//! Enqueueing is synchronous and never awaits, so per-lane FIFO order is the
//! enqueue order. A single writer task drains lanes highest-priority-first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::Notify;

use crate::state::lock;

/// Outbound lane selector, ordered by drain priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    FastData,
    RemoveOldest,
    Lossless,
}

#[derive(Default)]
struct Lanes {
    lossless: VecDeque<Value>,
    remove_oldest: VecDeque<Value>,
    fast_data: VecDeque<Value>,
    closed: bool,
}

pub struct OutboundQueues {
    lanes: Mutex<Lanes>,
    notify: Notify,
    lossy_capacity: usize,
    dropped: AtomicU64,
}

impl OutboundQueues {
    pub fn new(lossy_capacity: usize) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            notify: Notify::new(),
            lossy_capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a message on the given lane. Messages pushed after `close` are
    /// discarded silently.
    pub fn push(&self, priority: Priority, message: Value) {
        {
            let mut lanes = lock(&self.lanes);
            if lanes.closed {
                return;
            }
            match priority {
                Priority::Lossless => lanes.lossless.push_back(message),
                Priority::FastData => lanes.fast_data.push_back(message),
                Priority::RemoveOldest => {
                    if lanes.remove_oldest.len() >= self.lossy_capacity {
                        lanes.remove_oldest.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    lanes.remove_oldest.push_back(message);
                }
            }
        }
        self.notify.notify_one();
    }

    /// Pop the next message, highest-priority lane first.
    pub fn pop(&self) -> Option<Value> {
        let mut lanes = lock(&self.lanes);
        lanes
            .lossless
            .pop_front()
            .or_else(|| lanes.remove_oldest.pop_front())
            .or_else(|| lanes.fast_data.pop_front())
    }

    /// Wait until at least one message has been enqueued since the last drain.
    pub async fn ready(&self) {
        self.notify.notified().await;
    }

    /// Stop accepting messages and drop everything still queued.
    pub fn close(&self) {
        let mut lanes = lock(&self.lanes);
        lanes.closed = true;
        lanes.lossless.clear();
        lanes.remove_oldest.clear();
        lanes.fast_data.clear();
    }

    /// Messages dropped from the remove-oldest lane so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn queued(&self) -> usize {
        let lanes = lock(&self.lanes);
        lanes.lossless.len() + lanes.remove_oldest.len() + lanes.fast_data.len()
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
