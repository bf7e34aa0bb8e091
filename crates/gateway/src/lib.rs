// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! gridlink-gateway: GUI gateway between interactive clients and the
//! gridlink control fabric.
//!
//! Clients connect over WebSocket and exchange framed typed JSON messages;
//! the fabric side is a NATS broker reached through the [`remote`] seam. The
//! gateway owns all per-client state, coalesces topology chatter through the
//! [`throttler`], fans out monitored device updates and pipeline data, and
//! bridges request/reply traffic with timeout classification.

pub mod config;
pub mod error;
pub mod history;
pub mod instantiate;
pub mod logfwd;
pub mod messages;
pub mod monitor;
pub mod pipeline;
pub mod project;
pub mod queue;
pub mod registry;
pub mod remote;
pub mod router;
pub mod state;
pub mod throttler;
pub mod topology;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::remote::NatsRemote;
use crate::state::Gateway;
use crate::transport::build_router;

/// Run the gateway until shutdown.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let shutdown = CancellationToken::new();

    let remote = NatsRemote::connect(&config, shutdown.clone()).await?;
    let gateway = Gateway::new(config, Arc::new(remote), shutdown.clone());
    gateway.start();

    topology::spawn_event_pump(Arc::clone(&gateway));
    topology::bootstrap(&gateway).await;
    instantiate::spawn_instantiation_pump(Arc::clone(&gateway));
    logfwd::spawn_log_forwarder(Arc::clone(&gateway));
    logfwd::spawn_network_monitor(Arc::clone(&gateway));
    spawn_heartbeat(Arc::clone(&gateway));

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                shutdown.cancel();
            }
        });
    }

    let router = build_router(Arc::clone(&gateway));
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("gridlink gateway listening on {addr}");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // Shutdown order: the listener and client tasks are gone, the timer tasks
    // observed the token; push out whatever topology changes are still
    // buffered before the fabric connection drops.
    gateway.flush_topology_changes();
    Ok(())
}

/// Announce liveness to the fabric on a slow beat. A failed publish is logged
/// and stops this timer from re-arming; only the topology throttler re-arms
/// unconditionally.
fn spawn_heartbeat(gateway: Arc<Gateway>) {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(gateway.config.heartbeat_interval());
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = gateway.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let beat = serde_json::json!({ "heartbeat": gateway.config.gateway_id });
            if let Err(e) = gateway.remote.publish_status(beat).await {
                tracing::error!(err = %e, "heartbeat publish failed, heartbeat timer will not re-arm");
                break;
            }
        }
    });
}
