// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-client connection lifecycle.
//!
//! On accept the client gets the gateway banner and a login-only phase: the
//! sole accepted message type is `login`, anything else is answered with a
//! notification and the phase re-arms. A version check gates admission; a
//! refused client gets a notification and a short grace period before the
//! socket closes. After login one writer task drains the client's outbound
//! lanes while the read loop feeds the request router; either side ending
//! tears the whole connection down through the registry cleanup path.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use crate::error::FailureKind;
use crate::messages;
use crate::queue::Priority;
use crate::router;
use crate::state::{ClientHandle, ClientRecord, Gateway};

/// Grace period between a login refusal and the server-side close, so the
/// notification still reaches the client.
const REFUSAL_GRACE: Duration = Duration::from_millis(500);

/// Login payload; every other field of the message is ignored.
#[derive(Debug, Deserialize)]
struct LoginRequest {
    version: Option<String>,
    username: Option<String>,
    #[serde(rename = "oneTimeToken")]
    one_time_token: Option<String>,
}

/// `GET /ws` — WebSocket upgrade for GUI clients.
pub async fn ws_handler(
    State(gateway): State<Arc<Gateway>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(gateway, socket))
}

async fn handle_connection(gateway: Arc<Gateway>, socket: WebSocket) {
    let (mut tx, mut rx) = socket.split();

    let banner = messages::broker_information(&gateway.config);
    if send_value(&mut tx, &banner).await.is_err() {
        return;
    }

    let Some(record) = login_phase(&gateway, &mut tx, &mut rx).await else {
        let _ = tx.close().await;
        return;
    };

    let client = Arc::new(ClientHandle::new(
        gateway.next_client_id(),
        record,
        gateway.config.lossy_data_queue_capacity as usize,
    ));
    gateway.register_client(Arc::clone(&client));
    tokio::spawn(writer_loop(Arc::clone(&client), tx));

    client.send(
        Priority::Lossless,
        messages::system_topology(gateway.remote.system_topology().await),
    );

    read_loop(&gateway, &client, &mut rx).await;
    gateway.on_client_error(&client);
}

/// Accept only `login` until admission succeeds; answer anything else with a
/// notification and keep listening.
async fn login_phase(
    gateway: &Arc<Gateway>,
    tx: &mut SplitSink<WebSocket, Message>,
    rx: &mut SplitStream<WebSocket>,
) -> Option<ClientRecord> {
    loop {
        let text = match rx.next().await? {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        };
        let Ok(msg) = serde_json::from_str::<Value>(&text) else {
            tracing::warn!(kind = %FailureKind::Decode, "undecodable pre-login message");
            continue;
        };
        let Some(msg_type) = messages::msg_type(&msg) else {
            tracing::warn!(kind = %FailureKind::Decode, "pre-login message without type");
            continue;
        };

        if msg_type != "login" {
            tracing::warn!(%msg_type, "request from client not yet logged in");
            let refusal = messages::notification(format!("Action '{msg_type}' refused before log in"));
            if send_value(tx, &refusal).await.is_err() {
                return None;
            }
            continue;
        }

        let login: LoginRequest = match serde_json::from_str(&text) {
            Ok(login) => login,
            Err(e) => {
                tracing::warn!(kind = %FailureKind::Decode, err = %e, "malformed login request");
                if send_value(tx, &messages::notification("Malformed login request")).await.is_err()
                {
                    return None;
                }
                continue;
            }
        };
        let username = login.username.unwrap_or_else(|| "unknown".to_owned());
        let Some(version) = login.version else {
            let refusal = messages::notification("Login request lacks a client version");
            if send_value(tx, &refusal).await.is_err() {
                return None;
            }
            continue;
        };
        let Ok(version) = semver::Version::parse(&version) else {
            let refusal =
                messages::notification(format!("Unparseable client version '{version}'"));
            if send_value(tx, &refusal).await.is_err() {
                return None;
            }
            continue;
        };

        // An unparseable configured minimum disables the check.
        if let Ok(minimum) = semver::Version::parse(&gateway.config.min_client_version) {
            if version < minimum {
                tracing::warn!(
                    kind = %FailureKind::VersionTooOld,
                    %username,
                    %version,
                    "refused login"
                );
                let refusal = messages::notification(format!(
                    "Your client has version '{version}', but the minimum required is: {}",
                    gateway.config.min_client_version
                ));
                let _ = send_value(tx, &refusal).await;
                tokio::time::sleep(REFUSAL_GRACE).await;
                return None;
            }
        }

        tracing::info!(%username, %version, "login accepted");
        let mut record = ClientRecord::new(version, username);
        record.one_time_token = login.one_time_token;
        return Some(record);
    }
}

async fn read_loop(gateway: &Arc<Gateway>, client: &Arc<ClientHandle>, rx: &mut SplitStream<WebSocket>) {
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => break,
            _ = gateway.shutdown.cancelled() => break,
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        client
                            .bytes_read
                            .fetch_add(text.len() as u64, std::sync::atomic::Ordering::Relaxed);
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => router::dispatch(gateway, client, value).await,
                            Err(e) => {
                                tracing::warn!(
                                    client_id = client.id,
                                    kind = %FailureKind::Decode,
                                    err = %e,
                                    "undecodable client message"
                                );
                                client.send(
                                    Priority::Lossless,
                                    messages::notification("Malformed message: not a JSON object"),
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(client_id = client.id, err = %e, "client socket error");
                        break;
                    }
                    Some(Ok(_)) => {} // binary, ping, pong
                }
            }
        }
    }
}

/// Drain the outbound lanes, highest priority first, into the socket.
async fn writer_loop(client: Arc<ClientHandle>, mut tx: SplitSink<WebSocket, Message>) {
    loop {
        tokio::select! {
            _ = client.cancel.cancelled() => break,
            _ = client.queues.ready() => {}
        }
        while let Some(message) = client.queues.pop() {
            match serde_json::to_string(&message) {
                Ok(text) => {
                    client
                        .bytes_written
                        .fetch_add(text.len() as u64, std::sync::atomic::Ordering::Relaxed);
                    if tx.send(Message::Text(text.into())).await.is_err() {
                        // Socket is gone; the read loop notices through the
                        // cancel token and runs the cleanup.
                        client.cancel.cancel();
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(client_id = client.id, err = %e, "unserializable outbound message");
                }
            }
        }
    }
    let _ = tx.close().await;
}

async fn send_value(
    tx: &mut SplitSink<WebSocket, Message>,
    value: &Value,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(value).unwrap_or_default();
    tx.send(Message::Text(text.into())).await
}
