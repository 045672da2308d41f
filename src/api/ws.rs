//! Per-connection WebSocket loop
//!
//! Each socket gets a writer task fed from its hub queue and a read
//! loop that decodes frames into typed events. Decoding failure is an
//! input error answered on this connection only; nothing a handler
//! does can tear the socket down except the delayed auth kick.

use super::AppState;
use crate::agents::AgentIdentity;
use crate::events::{ClientEvent, ServerEvent};
use crate::hub::Frame;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4().to_string();
    tracing::debug!(conn_id, "WebSocket connected");

    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<Frame>();
    state.hub.connect(&conn_id, frame_tx);

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            match frame {
                Frame::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Frame::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    let mut agent: Option<AgentIdentity> = None;

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => route_event(&state, &conn_id, &mut agent, event).await,
                Err(e) => {
                    tracing::debug!(conn_id, error = %e, "Undecodable frame");
                    state.hub.emit_to(
                        &conn_id,
                        &ServerEvent::Error {
                            message: "Unrecognized event".to_string(),
                        },
                    );
                }
            },
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are ignored
            _ => {}
        }
    }

    tracing::debug!(conn_id, "WebSocket closed");
    state.hub.disconnect(&conn_id);
    state.dispatcher.handle_visitor_leave(&conn_id);
    if agent.is_some() {
        state.agents.handle_disconnect(&conn_id);
    }
    let _ = writer.await;
}

async fn route_event(
    state: &AppState,
    conn_id: &str,
    agent: &mut Option<AgentIdentity>,
    event: ClientEvent,
) {
    match event {
        // ---- visitor events ----
        ClientEvent::VisitorJoin { url, .. } => {
            state.dispatcher.handle_visitor_join(conn_id, &url);
        }
        ClientEvent::StartSession {
            session_id,
            user_meta,
        } => {
            state
                .dispatcher
                .handle_start_session(conn_id, &session_id, &user_meta);
        }
        ClientEvent::JoinSession { session_id } => {
            state.dispatcher.handle_join_session(conn_id, &session_id);
        }
        ClientEvent::UserMessage {
            session_id,
            text,
            msg_type,
            attachment_url,
        } => {
            state
                .dispatcher
                .handle_user_message(
                    conn_id,
                    &session_id,
                    &text,
                    msg_type.as_deref(),
                    attachment_url.as_deref(),
                )
                .await;
        }
        ClientEvent::RequestAgent { session_id } => {
            state.dispatcher.handle_request_agent(&session_id);
        }
        ClientEvent::RequestHuman { session_id, reason } => {
            state.dispatcher.handle_request_human(&session_id, &reason);
        }
        ClientEvent::SessionTimeout { session_id } => {
            state.dispatcher.handle_session_timeout(&session_id);
        }

        // ---- agent events ----
        ClientEvent::AgentAuth { token, agent_id } => {
            *agent = state
                .agents
                .handle_auth(conn_id, &token, agent_id.as_deref());
        }
        ClientEvent::AgentTakeover { session_id, .. } => {
            let Some(identity) = agent.as_ref() else {
                require_auth(state, conn_id);
                return;
            };
            state.agents.handle_takeover(conn_id, identity, &session_id);
        }
        ClientEvent::AgentMessage {
            session_id,
            text,
            msg_type,
            attachment_url,
            ..
        } => {
            let Some(identity) = agent.as_ref() else {
                require_auth(state, conn_id);
                return;
            };
            state.agents.handle_agent_message(
                conn_id,
                identity,
                &session_id,
                &text,
                msg_type.as_deref(),
                attachment_url.as_deref(),
            );
        }
        ClientEvent::InternalNote {
            session_id, text, ..
        } => {
            let Some(identity) = agent.as_ref() else {
                require_auth(state, conn_id);
                return;
            };
            state
                .agents
                .handle_internal_note(conn_id, identity, &session_id, &text);
        }
        ClientEvent::InitiateChat {
            target_connection_id,
            message,
            agent_id,
        } => {
            let Some(identity) = agent.as_ref() else {
                require_auth(state, conn_id);
                return;
            };
            if let Some(outcome) = state.proactive.handle_initiate_chat(
                conn_id,
                identity,
                &target_connection_id,
                &message,
                &agent_id,
            ) {
                tracing::info!(
                    session_id = %outcome.session_id,
                    agent_id = %identity.agent_id,
                    "Proactive chat started"
                );
                if outcome.visitor_updated {
                    state.dispatcher.broadcast_visitors();
                }
            }
        }
        ClientEvent::JoinAdminFeed => {
            if agent.is_none() {
                require_auth(state, conn_id);
                return;
            }
            state.agents.handle_join_admin_feed(conn_id);
        }
    }
}

fn require_auth(state: &AppState, conn_id: &str) {
    state.hub.emit_to(
        conn_id,
        &ServerEvent::AuthError {
            message: "Authenticate first".to_string(),
        },
    );
}
