use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use memeloop_common::{ClientMessage, ServerMessage};
use tokio::time::Instant;

use super::api::{AppState, SharedState};
use crate::errors::SessionError;
use crate::session::{SessionHandle, SubmitOutcome};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(client_id): Path<String>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, client_id, state))
}

async fn handle_socket(socket: WebSocket, client_id: String, state: SharedState) {
    let (mut sender, receiver) = socket.split();

    let handle = match state.registry.register(&client_id) {
        Ok(handle) => handle,
        Err(e) => {
            tracing::warn!(client_id = %client_id, error = %e, "handshake rejected");
            reject(&mut sender, &e).await;
            return;
        }
    };

    let session_id = handle.session_id;
    run_socket_loop(sender, receiver, handle, &state).await;
    state.registry.deregister_session(&client_id, session_id);
}

/// Tell the second connection why it is being dropped, then close it with
/// a policy-violation code.
async fn reject(sender: &mut SplitSink<WebSocket, Message>, err: &SessionError) {
    let notice = ServerMessage::event_log(format!("Connection rejected: {}", err));
    if let Ok(json) = serde_json::to_string(&notice) {
        let _ = sender.send(Message::Text(json.into())).await;
    }
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code: close_code::POLICY,
            reason: "duplicate session".into(),
        })))
        .await;
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards the session's outbound queue, answers client frames, and sends a
/// Ping every [`PING_INTERVAL`]. The loop ends when the client goes away, no
/// Pong arrives within [`PONG_TIMEOUT`], or the registry drops the session.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut handle: SessionHandle,
    state: &AppState,
) {
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // ── Periodic ping ───────────────────────────────────────
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    tracing::info!(client_id = %handle.client_id, "pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            // ── Outbound queue ──────────────────────────────────────
            outbound = handle.outbound.recv() => {
                let Some(message) = outbound else {
                    // Session removed from the registry.
                    break;
                };
                if !send_json(&mut sender, &message).await {
                    break;
                }
            }

            // ── Client frames ───────────────────────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_client_text(state, &handle.client_id, text.as_str()) {
                            if !send_json(&mut sender, &reply).await {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(client_id = %handle.client_id, error = %e, "socket error");
                        break;
                    }
                }
            }
        }
    }

    // Best-effort close frame
    let _ = sender.send(Message::Close(None)).await;
}

async fn send_json(sender: &mut SplitSink<WebSocket, Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound message");
            true
        }
    }
}

/// Route one inbound text frame. Returns the direct reply, if any.
pub(crate) fn handle_client_text(
    state: &AppState,
    client_id: &str,
    text: &str,
) -> Option<ServerMessage> {
    match ClientMessage::parse(text) {
        Ok(ClientMessage::Decision(payload)) => {
            let decision = payload.decision();
            let verdict = if decision.approved { "approved" } else { "rejected" };
            let outcome = state
                .correlator
                .submit_decision(client_id, &payload.command_id, decision);
            Some(match outcome {
                SubmitOutcome::Resolved => {
                    ServerMessage::event_log(format!("Decision received: {}", verdict))
                }
                SubmitOutcome::Unknown => ServerMessage::event_log(format!(
                    "Decision ignored: no pending approval for command {}",
                    payload.command_id
                )),
            })
        }
        Ok(ClientMessage::Other(data)) => Some(ServerMessage::Echo { data }),
        Err(e) => {
            tracing::warn!(client_id, error = %e, "unparseable client frame");
            None
        }
    }
}
