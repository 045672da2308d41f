//! Wire events for the WebSocket transport
//!
//! One JSON object per text frame, `{"event": <name>, "data": {...}}`.
//! Inbound frames decode into [`ClientEvent`]; a frame that fails to
//! decode is answered with an `error` event on the sending connection
//! only. Outbound frames are serialized from [`ServerEvent`] once per
//! emission.

use crate::db::Notification;
use crate::presence::Visitor;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Events received from visitors, agents and the dashboard.
/// Extra payload keys are ignored; the schemas here are the contract.
#[derive(Debug, Clone, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    VisitorJoin {
        url: String,
    },
    StartSession {
        session_id: String,
        #[serde(default)]
        user_meta: serde_json::Map<String, Value>,
    },
    JoinSession {
        session_id: String,
    },
    UserMessage {
        session_id: String,
        text: String,
        #[serde(rename = "type")]
        msg_type: Option<String>,
        attachment_url: Option<String>,
    },
    RequestAgent {
        session_id: String,
    },
    RequestHuman {
        session_id: String,
        #[serde(default)]
        reason: String,
    },
    SessionTimeout {
        session_id: String,
    },
    /// `agent_connect` is the legacy name for the same handshake.
    #[serde(alias = "agent_connect")]
    AgentAuth {
        token: String,
        agent_id: Option<String>,
    },
    AgentTakeover {
        session_id: String,
        agent_id: String,
    },
    AgentMessage {
        session_id: String,
        text: String,
        agent_id: String,
        #[serde(rename = "type")]
        msg_type: Option<String>,
        attachment_url: Option<String>,
    },
    InternalNote {
        session_id: String,
        text: String,
        agent_id: String,
    },
    InitiateChat {
        target_connection_id: String,
        message: String,
        agent_id: String,
    },
    JoinAdminFeed,
}

/// Events emitted to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    SessionStarted {
        session_id: String,
    },
    BotMessage {
        session_id: String,
        text: String,
        confidence: f64,
        #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
        msg_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        show_agent_button: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        options: Option<Vec<String>>,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    /// Cumulative partial text while an AI reply streams.
    BotStream {
        session_id: String,
        text: String,
    },
    AgentMessage {
        session_id: String,
        text: String,
        agent_id: String,
        sender: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attachment_url: Option<String>,
    },
    AgentJoined {
        session_id: String,
        agent_id: String,
    },
    AgentInitiatedChat {
        session_id: String,
        text: String,
        agent_id: String,
    },
    ConversationClosed {
        session_id: String,
    },
    /// Echo of the visitor's message when an agent holds the session.
    UserMessage {
        session_id: String,
        text: String,
        sender: String,
    },
    UserMessageForAgent {
        session_id: String,
        text: String,
        ts: String,
    },
    InternalNote {
        session_id: String,
        text: String,
        agent_id: String,
        visibility: String,
    },
    LiveVisitorsUpdate(Vec<Visitor>),
    AgentConnected {
        agent_id: String,
    },
    AgentDisconnected {
        agent_id: String,
        action: String,
    },
    AgentStatusChanged {
        agent_id: String,
        status: String,
        action: String,
    },
    NewNotification(Notification),
    AdminRingSound {
        session_id: String,
        reason: String,
    },
    SessionTimeoutWarning {
        session_id: String,
    },
    OfflineForm {
        session_id: String,
    },
    ChatInitiated {
        success: bool,
        session_id: String,
    },
    AuthSuccess {
        agent_id: String,
        user_id: String,
    },
    SessionError {
        message: String,
    },
    Error {
        message: String,
    },
    AuthError {
        message: String,
    },
}

impl ServerEvent {
    pub fn bot_message(session_id: &str, text: &str, confidence: f64) -> Self {
        ServerEvent::BotMessage {
            session_id: session_id.to_string(),
            text: text.to_string(),
            confidence,
            msg_type: None,
            show_agent_button: None,
            options: None,
            model: None,
        }
    }

    /// Serialize to a single wire frame.
    pub fn frame(&self) -> String {
        serde_json::to_string(self).expect("server event serializes")
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::SessionStarted { .. } => "session_started",
            ServerEvent::BotMessage { .. } => "bot_message",
            ServerEvent::BotStream { .. } => "bot_stream",
            ServerEvent::AgentMessage { .. } => "agent_message",
            ServerEvent::AgentJoined { .. } => "agent_joined",
            ServerEvent::AgentInitiatedChat { .. } => "agent_initiated_chat",
            ServerEvent::ConversationClosed { .. } => "conversation_closed",
            ServerEvent::UserMessage { .. } => "user_message",
            ServerEvent::UserMessageForAgent { .. } => "user_message_for_agent",
            ServerEvent::InternalNote { .. } => "internal_note",
            ServerEvent::LiveVisitorsUpdate(_) => "live_visitors_update",
            ServerEvent::AgentConnected { .. } => "agent_connected",
            ServerEvent::AgentDisconnected { .. } => "agent_disconnected",
            ServerEvent::AgentStatusChanged { .. } => "agent_status_changed",
            ServerEvent::NewNotification(_) => "new_notification",
            ServerEvent::AdminRingSound { .. } => "admin_ring_sound",
            ServerEvent::SessionTimeoutWarning { .. } => "session_timeout_warning",
            ServerEvent::OfflineForm { .. } => "offline_form",
            ServerEvent::ChatInitiated { .. } => "chat_initiated",
            ServerEvent::AuthSuccess { .. } => "auth_success",
            ServerEvent::SessionError { .. } => "session_error",
            ServerEvent::Error { .. } => "error",
            ServerEvent::AuthError { .. } => "auth_error",
        }
    }
}
