//! The WebSocket surface (§6.2): one socket per `GET /panels/:id/ws`
//! connection, fanning out `ServerMessage`s produced by the panel manager
//! and the orchestrator, and accepting `TRIGGER`/`SUBSCRIBE`/`UNSUBSCRIBE`/
//! `PING` from the client.
//!
//! Grounded on the golem debugging service's `handle_ws`/`handle_socket`
//! split (recv loop on one half of the socket, a background task forwarding
//! outbound messages on the other) generalized so `ClientSink::send` — a
//! synchronous trait method the panel manager calls from inside a
//! `DashMap` guard — can hand a message to the async socket without
//! blocking on it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use panelrt_core::panel::{ClientSink, ServerMessage};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::state::AppState;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// `{type:"TRIGGER"|"SUBSCRIBE"|"UNSUBSCRIBE"|"PING", ...}` (§6.2).
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "TRIGGER")]
    Trigger {
        tool: String,
        #[serde(default)]
        args: Option<Json>,
        #[serde(default)]
        request_id: Option<String>,
    },
    #[serde(rename = "SUBSCRIBE")]
    Subscribe { topics: Vec<String> },
    #[serde(rename = "UNSUBSCRIBE")]
    Unsubscribe { topics: Vec<String> },
    #[serde(rename = "PING")]
    Ping,
}

enum Outbound {
    Message(ServerMessage),
    Close(u16, String),
}

/// The `ClientSink` panelrt-core holds to broadcast onto this socket.
/// `send`/`close` are synchronous (called from inside the panel manager's
/// `DashMap` entry guard) so they just hand the message to an unbounded
/// channel; the forwarding task below does the actual async write.
struct WsClient {
    id: u64,
    tx: mpsc::UnboundedSender<Outbound>,
    topics: Mutex<HashSet<String>>,
}

impl ClientSink for WsClient {
    fn id(&self) -> u64 {
        self.id
    }

    fn send(&self, message: &ServerMessage) {
        let _ = self.tx.send(Outbound::Message(message.clone()));
    }

    fn topics(&self) -> Vec<String> {
        self.topics.lock().unwrap().iter().cloned().collect()
    }

    fn subscribe(&self, topic: &str) {
        self.topics.lock().unwrap().insert(topic.to_string());
    }

    fn unsubscribe(&self, topic: &str) {
        self.topics.lock().unwrap().remove(topic);
    }

    fn close(&self, code: u16, reason: &str) {
        let _ = self.tx.send(Outbound::Close(code, reason.to_string()));
    }
}

#[instrument(skip(socket, state))]
pub async fn handle_socket(socket: WebSocket, panel_id: String, state: AppState) {
    let client_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
    let (mut sink, mut stream) = socket.split();

    let Some(snapshot) = state.panels.state_snapshot(&panel_id) else {
        let _ = sink.send(close_frame(panelrt_core::CLOSE_ABNORMAL, "panel not found")).await;
        return;
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let client = Arc::new(WsClient {
        id: client_id,
        tx,
        topics: Mutex::new(HashSet::new()),
    });
    state.panels.add_client(&panel_id, client.clone());

    let connected = ServerMessage::Connected {
        panel_id: panel_id.clone(),
        state: serde_json::to_value(snapshot).unwrap_or(Json::Null),
    };
    if sink.send(to_ws_message(&connected)).await.is_err() {
        state.panels.remove_client(&panel_id, client_id);
        return;
    }

    let forward_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(msg) => {
                    if sink.send(to_ws_message(&msg)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let _ = sink.send(close_frame(code, &reason)).await;
                    break;
                }
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => handle_client_message(&state, &panel_id, client_id, &text).await,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
        }
    }

    state.panels.remove_client(&panel_id, client_id);
    forward_task.abort();
    debug!(panel = %panel_id, client = client_id, "websocket client disconnected");
}

async fn handle_client_message(state: &AppState, panel_id: &str, client_id: u64, text: &str) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let client_message = match parsed {
        Ok(m) => m,
        Err(err) => {
            warn!(panel = %panel_id, %err, "dropping malformed websocket frame");
            state.panels.send_result(
                panel_id,
                Some(client_id),
                None,
                error_result(panelrt_common::ErrorCode::InvalidHandler, "malformed message"),
            );
            return;
        }
    };

    match client_message {
        ClientMessage::Trigger { tool, args, request_id } => {
            let orchestrator = state.orchestrator.clone();
            let panels = state.panels.clone();
            let panel_id = panel_id.to_string();
            tokio::spawn(async move {
                // PATCH/EVENT broadcasts for interim effects already went out
                // via the panel manager while this ran; RESULT goes only to
                // the triggering client (§7's propagation rule).
                match orchestrator.trigger_tool(&panel_id, &tool, args.unwrap_or(Json::Null)).await {
                    Ok(execution_result) => {
                        panels.send_result(&panel_id, Some(client_id), request_id, execution_result);
                    }
                    Err(err) => {
                        if let Some(client) = panels.client(&panel_id, client_id) {
                            client.send(&ServerMessage::Error {
                                code: panelrt_common::ErrorCode::InvalidHandler,
                                message: err.to_string(),
                            });
                        }
                    }
                }
            });
        }
        ClientMessage::Subscribe { topics } => {
            if let Some(client) = state.panels.client(panel_id, client_id) {
                for topic in topics {
                    client.subscribe(&topic);
                }
            }
        }
        ClientMessage::Unsubscribe { topics } => {
            if let Some(client) = state.panels.client(panel_id, client_id) {
                for topic in topics {
                    client.unsubscribe(&topic);
                }
            }
        }
        ClientMessage::Ping => {
            if let Some(client) = state.panels.client(panel_id, client_id) {
                client.send(&ServerMessage::Pong);
            }
        }
    }
}

fn error_result(code: panelrt_common::ErrorCode, message: &str) -> panelrt_common::ExecutionResult {
    panelrt_common::ExecutionResult {
        status: panelrt_common::ExecutionStatus::Error,
        return_value: None,
        state_mutations: Vec::new(),
        events: Vec::new(),
        view_commands: Vec::new(),
        suspension: None,
        error: Some(panelrt_common::RuntimeError::new(code, message)),
        metrics: panelrt_common::ExecutionMetrics::default(),
    }
}

fn to_ws_message(message: &ServerMessage) -> Message {
    Message::Text(serde_json::to_string(message).unwrap_or_else(|_| "{}".to_string()))
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_string().into(),
    }))
}
