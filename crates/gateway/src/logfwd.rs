// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Batched log forwarding and periodic network statistics.
//!
//! Fabric log records are filtered at ingest time against the configured
//! forwarding level and drained once per interval into a single batched
//! message on the drop-oldest lane. A second timer samples the byte counters
//! of all client sockets and pipeline subscriptions and republishes them as
//! observable gateway state.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::messages;
use crate::queue::Priority;
use crate::state::{lock, Gateway};

/// Lowest log level forwarded to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ForwardLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl ForwardLevel {
    /// Lower rank means higher priority.
    fn rank(self) -> u8 {
        match self {
            Self::Error => 0,
            Self::Warn => 1,
            Self::Info => 2,
            Self::Debug => 3,
        }
    }

    fn parse(level: &str) -> Option<Self> {
        match level.to_ascii_uppercase().as_str() {
            "ERROR" | "FATAL" => Some(Self::Error),
            "WARN" | "WARNING" => Some(Self::Warn),
            "INFO" => Some(Self::Info),
            "DEBUG" | "TRACE" => Some(Self::Debug),
            _ => None,
        }
    }

    /// Whether a record of level `message_level` passes this threshold.
    pub fn admits(self, message_level: &str) -> bool {
        match Self::parse(message_level) {
            Some(level) => level.rank() <= self.rank(),
            // Unknown levels are kept rather than silently lost.
            None => true,
        }
    }
}

impl std::fmt::Display for ForwardLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        })
    }
}

/// Filter one batch of fabric log records into the forwarding cache.
pub fn ingest(gateway: &Gateway, records: Vec<Value>) {
    let threshold = gateway.config.log_forwarding_level;
    let mut cache = lock(&gateway.log_cache);
    for record in records {
        let level = messages::str_field(&record, "type").unwrap_or("INFO");
        if threshold.admits(level) {
            cache.push(record);
        }
    }
}

/// Broadcast the accumulated log records as one batch per interval.
///
/// An error from the forwarding step is logged and stops this timer from
/// re-arming; only the topology throttler re-arms unconditionally.
pub fn spawn_log_forwarder(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(gateway.config.forward_log_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = gateway.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            if let Err(e) = forward_pending_logs(&gateway) {
                tracing::error!(err = %e, "log forwarding failed, forwarding timer will not re-arm");
                break;
            }
        }
    });
}

/// One forwarding cycle: the cache is move-transferred into the payload.
fn forward_pending_logs(gateway: &Gateway) -> anyhow::Result<()> {
    let batch = std::mem::take(&mut *lock(&gateway.log_cache));
    if !batch.is_empty() {
        gateway.broadcast(messages::log_batch(batch), Priority::RemoveOldest);
    }
    Ok(())
}

/// Sample client and pipeline traffic once per interval and publish the four
/// counters as observable gateway state.
///
/// A failed publish is logged and stops this timer from re-arming.
pub fn spawn_network_monitor(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(gateway.config.network_sample_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = gateway.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            if let Err(e) = sample_network(&gateway).await {
                tracing::error!(err = %e, "network sampling failed, monitor timer will not re-arm");
                break;
            }
        }
    });
}

/// One sampling cycle over all client sockets and pipeline subscriptions.
async fn sample_network(gateway: &Gateway) -> Result<(), crate::remote::RemoteError> {
    let mut client_bytes_read = 0u64;
    let mut client_bytes_written = 0u64;
    gateway.for_each_client(|client| {
        client_bytes_read += client.bytes_read.swap(0, Ordering::Relaxed);
        client_bytes_written += client.bytes_written.swap(0, Ordering::Relaxed);
    });
    let (pipeline_bytes_read, pipeline_bytes_written) = gateway.remote.pipeline_traffic().await;

    gateway
        .remote
        .publish_status(json!({
            "networkPerformance": {
                "clientBytesRead": client_bytes_read,
                "clientBytesWritten": client_bytes_written,
                "pipelineBytesRead": pipeline_bytes_read,
                "pipelineBytesWritten": pipeline_bytes_written,
            }
        }))
        .await
}

#[cfg(test)]
#[path = "logfwd_tests.rs"]
mod tests;
