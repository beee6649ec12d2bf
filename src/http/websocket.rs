//! WebSocket push channel.
//!
//! # Protocol
//! ```text
//! server → client: {"type":"connected", ...}
//!                  {"type":"config_change", key, value, version, metadata, seq}
//!                  {"type":"config_delete", key, version, seq}
//!                  {"type":"disconnected", reason}
//! client → server: {"type":"ping"}   (also the subscription heartbeat)
//! server → client: {"type":"pong"}
//! ```

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::http::error::ApiError;
use crate::http::server::AppState;
use crate::model::{ChangeEvent, ChangeKind, ConfigMetadata, ConfigValue, Scope, Version};

/// Messages sent to push-channel clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    Connected {
        namespace: String,
        environment: String,
        message: String,
    },
    ConfigChange {
        namespace: String,
        environment: String,
        key: String,
        value: ConfigValue,
        version: Version,
        metadata: ConfigMetadata,
        seq: u64,
    },
    ConfigDelete {
        namespace: String,
        environment: String,
        key: String,
        version: Version,
        seq: u64,
    },
    Disconnected {
        reason: String,
    },
    Pong,
}

impl From<&ChangeEvent> for PushMessage {
    fn from(event: &ChangeEvent) -> Self {
        let namespace = event.scope.namespace().to_string();
        let environment = event.scope.environment().to_string();
        match (event.kind, &event.entry) {
            (ChangeKind::Put, Some(entry)) => PushMessage::ConfigChange {
                namespace,
                environment,
                key: event.key.clone(),
                value: entry.value.clone(),
                version: event.version,
                metadata: entry.metadata.clone(),
                seq: event.seq,
            },
            _ => PushMessage::ConfigDelete {
                namespace,
                environment,
                key: event.key.clone(),
                version: event.version,
                seq: event.seq,
            },
        }
    }
}

impl PushMessage {
    fn to_frame(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode push message");
                None
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
}

fn is_ping(text: &str) -> bool {
    serde_json::from_str::<ClientMessage>(text).is_ok_and(|m| m.kind == "ping")
}

pub async fn subscribe(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((namespace, environment)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let scope = Scope::new(namespace, environment)?;
    Ok(ws.on_upgrade(move |socket| serve(socket, state, scope)))
}

async fn serve(socket: WebSocket, state: AppState, scope: Scope) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = match state.runtime.hub().subscribe(&scope).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(scope = %scope, error = %e, "WebSocket subscription refused");
            if let Some(frame) = (PushMessage::Disconnected { reason: e.to_string() }).to_frame() {
                let _ = sender.send(frame).await;
            }
            return;
        }
    };

    let hello = PushMessage::Connected {
        namespace: scope.namespace().to_string(),
        environment: scope.environment().to_string(),
        message: "Connected to config updates".to_string(),
    };
    if let Some(frame) = hello.to_frame() {
        if sender.send(frame).await.is_err() {
            return;
        }
    }
    tracing::info!(scope = %scope, subscriber = %subscription.id(), "WebSocket client connected");

    loop {
        tokio::select! {
            received = subscription.recv() => {
                let message = match received {
                    Ok(event) => PushMessage::from(event.as_ref()),
                    Err(reason) => {
                        if let Some(frame) = (PushMessage::Disconnected { reason: reason.to_string() }).to_frame() {
                            let _ = sender.send(frame).await;
                        }
                        break;
                    }
                };
                if let Some(frame) = message.to_frame() {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if is_ping(text.as_str()) {
                        subscription.heartbeat();
                        if let Some(frame) = PushMessage::Pong.to_frame() {
                            if sender.send(frame).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => subscription.heartbeat(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    tracing::info!(scope = %scope, subscriber = %subscription.id(), "WebSocket client disconnected");
    subscription.unsubscribe();
}
