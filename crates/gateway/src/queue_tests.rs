// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde_json::json;

use super::*;

#[test]
fn drains_highest_priority_lane_first() {
    let queues = OutboundQueues::new(10);
    queues.push(Priority::FastData, json!({"lane": "fast"}));
    queues.push(Priority::RemoveOldest, json!({"lane": "lossy"}));
    queues.push(Priority::Lossless, json!({"lane": "control"}));

    assert_eq!(queues.pop().and_then(|m| m["lane"].as_str().map(str::to_owned)), Some("control".into()));
    assert_eq!(queues.pop().and_then(|m| m["lane"].as_str().map(str::to_owned)), Some("lossy".into()));
    assert_eq!(queues.pop().and_then(|m| m["lane"].as_str().map(str::to_owned)), Some("fast".into()));
    assert!(queues.pop().is_none());
}

#[test]
fn preserves_fifo_order_within_a_lane() {
    let queues = OutboundQueues::new(10);
    for n in 0..5 {
        queues.push(Priority::Lossless, json!({"n": n}));
    }
    for n in 0..5 {
        assert_eq!(queues.pop().and_then(|m| m["n"].as_i64()), Some(n));
    }
}

#[test]
fn remove_oldest_lane_drops_its_oldest_entry_on_overflow() {
    let queues = OutboundQueues::new(2);
    queues.push(Priority::RemoveOldest, json!({"n": 0}));
    queues.push(Priority::RemoveOldest, json!({"n": 1}));
    queues.push(Priority::RemoveOldest, json!({"n": 2}));

    assert_eq!(queues.dropped(), 1);
    assert_eq!(queues.pop().and_then(|m| m["n"].as_i64()), Some(1));
    assert_eq!(queues.pop().and_then(|m| m["n"].as_i64()), Some(2));
    assert!(queues.pop().is_none());
}

#[test]
fn lossless_lanes_never_drop() {
    let queues = OutboundQueues::new(2);
    for n in 0..50 {
        queues.push(Priority::Lossless, json!({"n": n}));
        queues.push(Priority::FastData, json!({"n": n}));
    }
    assert_eq!(queues.dropped(), 0);
    assert_eq!(queues.queued(), 100);
}

#[test]
fn closed_queues_discard_pushes() {
    let queues = OutboundQueues::new(10);
    queues.push(Priority::Lossless, json!({"n": 0}));
    queues.close();
    queues.push(Priority::Lossless, json!({"n": 1}));

    assert_eq!(queues.queued(), 0);
    assert!(queues.pop().is_none());
}

#[tokio::test]
async fn ready_wakes_for_a_push_that_raced_the_drain() {
    let queues = OutboundQueues::new(10);
    queues.push(Priority::Lossless, json!({}));
    // The permit is stored even though nobody was waiting yet.
    queues.ready().await;
    assert!(queues.pop().is_some());
}
