//! Database schema and row types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'active',
    assigned_agent TEXT,
    user_meta TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    last_seen TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sender TEXT NOT NULL,
    text TEXT NOT NULL,
    attachment_url TEXT,
    visibility TEXT NOT NULL DEFAULT 'public',
    confidence REAL,
    agent_id TEXT,
    msg_type TEXT,
    filtered INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    roles TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'offline'
);

CREATE TABLE IF NOT EXISTS notifications (
    id TEXT PRIMARY KEY,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT NOT NULL,
    severity TEXT NOT NULL DEFAULT 'info',
    user_id TEXT,
    session_id TEXT,
    is_read INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_notifications_user ON notifications(user_id, created_at DESC);

CREATE TABLE IF NOT EXISTS accuracy_records (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    text TEXT NOT NULL,
    confidence REAL NOT NULL,
    latency_ms INTEGER NOT NULL,
    tokens INTEGER NOT NULL,
    response_type TEXT NOT NULL,
    metadata TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_accuracy_session ON accuracy_records(session_id, created_at);

CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Per-session conversation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    AgentAssigned,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::AgentAssigned => "agent_assigned",
            SessionStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "agent_assigned" => SessionStatus::AgentAssigned,
            "closed" => SessionStatus::Closed,
            _ => SessionStatus::Active,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One conversation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub assigned_agent: Option<String>,
    pub user_meta: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Session {
    pub fn conversation_concluded(&self) -> bool {
        self.user_meta
            .get("conversationConcluded")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Message sender kinds. `Internal` implies internal visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Bot,
    Agent,
    Internal,
}

impl Sender {
    pub fn as_str(self) -> &'static str {
        match self {
            Sender::User => "user",
            Sender::Bot => "bot",
            Sender::Agent => "agent",
            Sender::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "bot" => Sender::Bot,
            "agent" => Sender::Agent,
            "internal" => Sender::Internal,
            _ => Sender::User,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    #[default]
    Public,
    Internal,
}

impl Visibility {
    pub fn as_str(self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Internal => "internal",
        }
    }
}

/// One persisted turn.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender: Sender,
    pub text: String,
    pub attachment_url: Option<String>,
    pub visibility: Visibility,
    pub confidence: Option<f64>,
    pub agent_id: Option<String>,
    pub msg_type: Option<String>,
    pub filtered: bool,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for [`Message`]; id and timestamp are assigned by the
/// repository.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub session_id: String,
    pub sender: Sender,
    pub text: String,
    pub attachment_url: Option<String>,
    pub visibility: Visibility,
    pub confidence: Option<f64>,
    pub agent_id: Option<String>,
    pub msg_type: Option<String>,
    pub filtered: bool,
}

impl NewMessage {
    pub fn new(session_id: &str, sender: Sender, text: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            sender,
            text: text.to_string(),
            attachment_url: None,
            visibility: if sender == Sender::Internal {
                Visibility::Internal
            } else {
                Visibility::Public
            },
            confidence: None,
            agent_id: None,
            msg_type: None,
            filtered: false,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_string());
        self
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_attachment(mut self, url: Option<String>) -> Self {
        self.attachment_url = url;
        self
    }

    pub fn filtered(mut self) -> Self {
        self.filtered = true;
        self
    }
}

/// A registered dashboard user (agent or admin).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub name: String,
    pub email: Option<String>,
    pub roles: Vec<crate::auth::Role>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub body: String,
    pub severity: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNotification {
    pub kind: String,
    pub title: String,
    pub body: String,
    pub severity: String,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl NewNotification {
    pub fn new(kind: &str, title: &str, body: &str) -> Self {
        Self {
            kind: kind.to_string(),
            title: title.to_string(),
            body: body.to_string(),
            severity: "info".to_string(),
            user_id: None,
            session_id: None,
        }
    }

    pub fn for_session(mut self, session_id: &str) -> Self {
        self.session_id = Some(session_id.to_string());
        self
    }

    pub fn for_user(mut self, user_id: &str) -> Self {
        self.user_id = Some(user_id.to_string());
        self
    }

    pub fn with_severity(mut self, severity: &str) -> Self {
        self.severity = severity.to_string();
        self
    }
}

/// How a bot reply was produced; audited per reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Preloaded,
    Stub,
    Ai,
    Fallback,
    Vision,
}

impl ResponseType {
    pub fn as_str(self) -> &'static str {
        match self {
            ResponseType::Preloaded => "preloaded",
            ResponseType::Stub => "stub",
            ResponseType::Ai => "ai",
            ResponseType::Fallback => "fallback",
            ResponseType::Vision => "vision",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAccuracyRecord {
    pub session_id: String,
    pub text: String,
    pub confidence: f64,
    pub latency_ms: i64,
    pub tokens: i64,
    pub response_type: ResponseType,
    pub metadata: Option<String>,
}

/// Mutation set for one session; unset fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    /// `Some(None)` clears the assignment.
    pub assigned_agent: Option<Option<String>>,
    /// Keys merged into `user_meta`.
    pub merge_meta: Option<Map<String, Value>>,
    pub touch_last_seen: bool,
}

impl SessionPatch {
    pub fn status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn assign(mut self, agent_id: Option<&str>) -> Self {
        self.assigned_agent = Some(agent_id.map(String::from));
        self
    }

    pub fn meta(mut self, key: &str, value: Value) -> Self {
        self.merge_meta
            .get_or_insert_with(Map::new)
            .insert(key.to_string(), value);
        self
    }

    pub fn touch(mut self) -> Self {
        self.touch_last_seen = true;
        self
    }
}
