//! Persistence for sessions, messages, users, notifications, accuracy
//! records and application settings.
//!
//! The rest of the system treats this as the repository boundary: all
//! calls return typed results, and callers on the hot dispatch path are
//! expected to tolerate failure (log and carry on) rather than abort a
//! broadcast.

mod schema;

pub use schema::*;

use crate::auth::Role;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),
    #[error("Invalid role: {0}")]
    InvalidRole(String),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DbError::SessionNotFound(_) | DbError::UserNotFound(_))
    }
}

pub type DbResult<T> = Result<T, DbError>;

/// Longest accepted settings value.
const MAX_SETTING_LEN: usize = 5000;
/// Accuracy metadata is stored at exactly this many chars or fewer.
const MAX_METADATA_LEN: usize = 255;

pub const SETTING_SYSTEM_PROMPT: &str = "system_prompt";
pub const SETTING_CONTEXT_LIMIT: &str = "context_limit";
pub const SETTING_WELCOME_MESSAGE: &str = "welcome_message";
pub const SETTING_IMAGE_PROMPT: &str = "image_analysis_prompt";

pub const DEFAULT_CONTEXT_LIMIT: usize = 20;
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a friendly customer support assistant for this \
    website. Answer concisely and helpfully, in at most 30 words. If you do not know the answer, \
    say so and offer to connect the visitor with a human agent.";
pub const DEFAULT_WELCOME_MESSAGE: &str =
    "Hi! I'm your AI Assistant. How can I help you today?";
pub const DEFAULT_IMAGE_PROMPT: &str = "Describe what is shown in this image and answer the \
    visitor's question about it, in at most 30 words.";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Sessions ====================

    /// Create a session; `Conflict` if the id already exists.
    pub fn create_session(
        &self,
        id: &str,
        meta: &serde_json::Map<String, serde_json::Value>,
    ) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let meta_json = serde_json::Value::Object(meta.clone()).to_string();

        conn.execute(
            "INSERT INTO sessions (id, status, assigned_agent, user_meta, created_at, last_seen)
             VALUES (?1, 'active', NULL, ?2, ?3, ?3)",
            params![id, meta_json, ts(now)],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => DbError::Conflict(id.to_string()),
            _ => DbError::Sqlite(e),
        })?;

        fetch_session(&conn, id)
    }

    /// Create the session if missing, then return it. Idempotent.
    pub fn ensure_session(
        &self,
        id: &str,
        meta: &serde_json::Map<String, serde_json::Value>,
    ) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let meta_json = serde_json::Value::Object(meta.clone()).to_string();
        conn.execute(
            "INSERT OR IGNORE INTO sessions (id, status, assigned_agent, user_meta, created_at, last_seen)
             VALUES (?1, 'active', NULL, ?2, ?3, ?3)",
            params![id, meta_json, ts(now)],
        )?;
        fetch_session(&conn, id)
    }

    pub fn get_session(&self, id: &str) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        fetch_session(&conn, id)
    }

    /// Apply a [`SessionPatch`] and return the updated row.
    pub fn update_session(&self, id: &str, patch: &SessionPatch) -> DbResult<Session> {
        let conn = self.conn.lock().unwrap();
        let current = fetch_session(&conn, id)?;

        if let Some(status) = patch.status {
            conn.execute(
                "UPDATE sessions SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )?;
        }
        if let Some(assignment) = &patch.assigned_agent {
            conn.execute(
                "UPDATE sessions SET assigned_agent = ?2 WHERE id = ?1",
                params![id, assignment.as_deref()],
            )?;
        }
        if let Some(merge) = &patch.merge_meta {
            let mut meta = current.user_meta.clone();
            for (k, v) in merge {
                meta.insert(k.clone(), v.clone());
            }
            conn.execute(
                "UPDATE sessions SET user_meta = ?2 WHERE id = ?1",
                params![id, serde_json::Value::Object(meta).to_string()],
            )?;
        }
        if patch.touch_last_seen {
            conn.execute(
                "UPDATE sessions SET last_seen = ?2 WHERE id = ?1",
                params![id, ts(Utc::now())],
            )?;
        }

        fetch_session(&conn, id)
    }

    // ==================== Messages ====================

    pub fn append_message(&self, msg: &NewMessage) -> DbResult<Message> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        conn.execute(
            "INSERT INTO messages
                (id, session_id, sender, text, attachment_url, visibility, confidence,
                 agent_id, msg_type, filtered, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                id,
                msg.session_id,
                msg.sender.as_str(),
                msg.text,
                msg.attachment_url,
                msg.visibility.as_str(),
                msg.confidence,
                msg.agent_id,
                msg.msg_type,
                msg.filtered,
                ts(now),
            ],
        )?;

        Ok(Message {
            id,
            session_id: msg.session_id.clone(),
            sender: msg.sender,
            text: msg.text.clone(),
            attachment_url: msg.attachment_url.clone(),
            visibility: msg.visibility,
            confidence: msg.confidence,
            agent_id: msg.agent_id.clone(),
            msg_type: msg.msg_type.clone(),
            filtered: msg.filtered,
            created_at: now,
        })
    }

    /// Messages for a session in insertion order (or newest first).
    /// Serves the admin transcript surface; tests lean on it heavily.
    #[allow(dead_code)]
    pub fn list_messages(
        &self,
        session_id: &str,
        limit: usize,
        ascending: bool,
    ) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let order = if ascending { "ASC" } else { "DESC" };
        let sql = format!(
            "SELECT id, session_id, sender, text, attachment_url, visibility, confidence,
                    agent_id, msg_type, filtered, created_at
             FROM messages WHERE session_id = ?1
             ORDER BY created_at {order}, rowid {order} LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id, limit as i64], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    /// The AI history window: up to `limit` newest non-internal
    /// messages, returned ascending, optionally excluding one message
    /// (the turn currently being answered).
    pub fn recent_dialogue(
        &self,
        session_id: &str,
        limit: usize,
        exclude_id: Option<&str>,
    ) -> DbResult<Vec<Message>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, session_id, sender, text, attachment_url, visibility, confidence,
                    agent_id, msg_type, filtered, created_at
             FROM messages
             WHERE session_id = ?1 AND visibility != 'internal' AND id != COALESCE(?3, '')
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(
            params![session_id, limit as i64, exclude_id],
            parse_message_row,
        )?;
        let mut messages = rows.collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    // ==================== Users ====================

    /// User provisioning belongs to the admin surface; kept here so the
    /// repository owns every table it reads.
    #[allow(dead_code)]
    pub fn create_user(
        &self,
        id: &str,
        name: &str,
        email: Option<&str>,
        roles: &[Role],
        status: &str,
    ) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        let roles_json = serde_json::to_string(
            &roles.iter().map(|r| r.as_str()).collect::<Vec<_>>(),
        )
        .expect("roles serialize");
        conn.execute(
            "INSERT INTO users (id, name, email, roles, status) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, name, email, roles_json, status],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => DbError::Conflict(id.to_string()),
            _ => DbError::Sqlite(e),
        })?;
        self.get_user_locked(&conn, id)
    }

    #[allow(dead_code)] // Admin surface + tests
    pub fn get_user(&self, id: &str) -> DbResult<User> {
        let conn = self.conn.lock().unwrap();
        self.get_user_locked(&conn, id)
    }

    fn get_user_locked(&self, conn: &Connection, id: &str) -> DbResult<User> {
        let row = conn
            .query_row(
                "SELECT id, name, email, roles, status FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => DbError::UserNotFound(id.to_string()),
                other => DbError::Sqlite(other),
            })?;

        Ok(User {
            id: row.0,
            name: row.1,
            email: row.2,
            roles: parse_roles(&row.3)?,
            status: row.4,
        })
    }

    /// Users holding a role. Rows whose role list fails to parse are
    /// skipped with a warning rather than failing the whole query.
    pub fn find_users_by_role(&self, role: Role, limit: usize) -> DbResult<Vec<User>> {
        let conn = self.conn.lock().unwrap();
        let pattern = format!("%\"{}\"%", role.as_str());
        let mut stmt = conn.prepare(
            "SELECT id, name, email, roles, status FROM users WHERE roles LIKE ?1 LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut users = Vec::new();
        for row in rows {
            let (id, name, email, roles_json, status) = row?;
            match parse_roles(&roles_json) {
                Ok(roles) if roles.contains(&role) => users.push(User {
                    id,
                    name,
                    email,
                    roles,
                    status,
                }),
                Ok(_) => {}
                Err(e) => tracing::warn!(user_id = %id, error = %e, "Skipping user with bad roles"),
            }
        }
        Ok(users)
    }

    pub fn update_user_status(&self, user_id: &str, status: &str) -> DbResult<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE users SET status = ?2 WHERE id = ?1",
            params![user_id, status],
        )?;
        if changed == 0 {
            return Err(DbError::UserNotFound(user_id.to_string()));
        }
        Ok(())
    }

    // ==================== Notifications ====================

    pub fn create_notification(&self, n: &NewNotification) -> DbResult<Notification> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO notifications (id, kind, title, body, severity, user_id, session_id, is_read, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8)",
            params![
                id,
                n.kind,
                n.title,
                n.body,
                n.severity,
                n.user_id,
                n.session_id,
                ts(now),
            ],
        )?;
        Ok(Notification {
            id,
            kind: n.kind.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            severity: n.severity.clone(),
            user_id: n.user_id.clone(),
            session_id: n.session_id.clone(),
            read: false,
            created_at: now,
        })
    }

    // ==================== Accuracy records ====================

    /// Metadata longer than 255 chars is stored truncated to exactly
    /// 255, ending in an ellipsis.
    pub fn create_accuracy_record(&self, r: &NewAccuracyRecord) -> DbResult<String> {
        let conn = self.conn.lock().unwrap();
        let id = Uuid::new_v4().to_string();
        let metadata = r.metadata.as_deref().map(clamp_metadata);
        conn.execute(
            "INSERT INTO accuracy_records
                (id, session_id, text, confidence, latency_ms, tokens, response_type, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                id,
                r.session_id,
                r.text,
                r.confidence,
                r.latency_ms,
                r.tokens,
                r.response_type.as_str(),
                metadata,
                ts(Utc::now()),
            ],
        )?;
        Ok(id)
    }

    #[cfg(test)]
    pub fn count_notifications(&self, kind: &str) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM notifications WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn count_accuracy_records(&self, session_id: &str, response_type: &str) -> i64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM accuracy_records WHERE session_id = ?1 AND response_type = ?2",
            params![session_id, response_type],
            |row| row.get(0),
        )
        .unwrap_or(0)
    }

    #[cfg(test)]
    pub fn last_accuracy_metadata(&self, session_id: &str) -> Option<String> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT metadata FROM accuracy_records WHERE session_id = ?1 ORDER BY rowid DESC LIMIT 1",
            params![session_id],
            |row| row.get(0),
        )
        .unwrap_or(None)
    }

    // ==================== Settings ====================

    pub fn get_setting(&self, key: &str) -> DbResult<Option<String>> {
        let conn = self.conn.lock().unwrap();
        match conn.query_row(
            "SELECT value FROM app_settings WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        ) {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(DbError::Sqlite(e)),
        }
    }

    /// Write a setting, enforcing the boundary rules: values are capped
    /// at 5000 chars and `context_limit` must parse into 2..=50. The
    /// admin CRUD service is the production caller.
    #[allow(dead_code)]
    pub fn set_setting(&self, key: &str, value: &str) -> DbResult<()> {
        if value.chars().count() > MAX_SETTING_LEN {
            return Err(DbError::InvalidSetting(format!(
                "{key}: value exceeds {MAX_SETTING_LEN} chars"
            )));
        }
        if key == SETTING_CONTEXT_LIMIT {
            let parsed: i64 = value
                .trim()
                .parse()
                .map_err(|_| DbError::InvalidSetting(format!("{key}: not an integer")))?;
            if !(2..=50).contains(&parsed) {
                return Err(DbError::InvalidSetting(format!(
                    "{key}: must be between 2 and 50"
                )));
            }
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    pub fn context_limit(&self) -> usize {
        self.get_setting(SETTING_CONTEXT_LIMIT)
            .ok()
            .flatten()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|n| (2..=50).contains(n))
            .unwrap_or(DEFAULT_CONTEXT_LIMIT)
    }

    pub fn system_prompt(&self) -> String {
        self.get_setting(SETTING_SYSTEM_PROMPT)
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn welcome_message(&self) -> String {
        self.get_setting(SETTING_WELCOME_MESSAGE)
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT_WELCOME_MESSAGE.to_string())
    }

    pub fn image_analysis_prompt(&self) -> String {
        self.get_setting(SETTING_IMAGE_PROMPT)
            .ok()
            .flatten()
            .unwrap_or_else(|| DEFAULT_IMAGE_PROMPT.to_string())
    }
}

fn fetch_session(conn: &Connection, id: &str) -> DbResult<Session> {
    conn.query_row(
        "SELECT id, status, assigned_agent, user_meta, created_at, last_seen
         FROM sessions WHERE id = ?1",
        params![id],
        |row| {
            let meta_json: String = row.get(3)?;
            let user_meta = serde_json::from_str::<serde_json::Value>(&meta_json)
                .ok()
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            Ok(Session {
                id: row.get(0)?,
                status: SessionStatus::parse(&row.get::<_, String>(1)?),
                assigned_agent: row.get(2)?,
                user_meta,
                created_at: parse_datetime(&row.get::<_, String>(4)?),
                last_seen: parse_datetime(&row.get::<_, String>(5)?),
            })
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::SessionNotFound(id.to_string()),
        other => DbError::Sqlite(other),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        session_id: row.get(1)?,
        sender: Sender::parse(&row.get::<_, String>(2)?),
        text: row.get(3)?,
        attachment_url: row.get(4)?,
        visibility: if row.get::<_, String>(5)? == "internal" {
            Visibility::Internal
        } else {
            Visibility::Public
        },
        confidence: row.get(6)?,
        agent_id: row.get(7)?,
        msg_type: row.get(8)?,
        filtered: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
    })
}

fn parse_roles(json: &str) -> DbResult<Vec<Role>> {
    let names: Vec<String> =
        serde_json::from_str(json).map_err(|_| DbError::InvalidRole(json.to_string()))?;
    names
        .iter()
        .map(|n| Role::parse(n).ok_or_else(|| DbError::InvalidRole(n.clone())))
        .collect()
}

fn clamp_metadata(s: &str) -> String {
    if s.chars().count() <= MAX_METADATA_LEN {
        return s.to_string();
    }
    let mut out: String = s.chars().take(MAX_METADATA_LEN - 3).collect();
    out.push_str("...");
    out
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn create_and_get_session() {
        let db = db();
        let s = db.create_session("s1", &Map::new()).unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert!(s.assigned_agent.is_none());
        assert!(!s.conversation_concluded());

        let err = db.create_session("s1", &Map::new()).unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let db = db();
        let a = db.ensure_session("s1", &Map::new()).unwrap();
        let b = db.ensure_session("s1", &Map::new()).unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(a.created_at, b.created_at);
    }

    #[test]
    fn missing_session_is_not_found() {
        let db = db();
        assert!(matches!(
            db.get_session("nope"),
            Err(DbError::SessionNotFound(_))
        ));
    }

    #[test]
    fn patch_assignment_and_meta() {
        let db = db();
        db.create_session("s1", &Map::new()).unwrap();

        let s = db
            .update_session(
                "s1",
                &SessionPatch::default()
                    .status(SessionStatus::AgentAssigned)
                    .assign(Some("a1"))
                    .meta("assignedAgent", serde_json::json!("a1")),
            )
            .unwrap();
        assert_eq!(s.status, SessionStatus::AgentAssigned);
        assert_eq!(s.assigned_agent.as_deref(), Some("a1"));

        let s = db
            .update_session(
                "s1",
                &SessionPatch::default()
                    .status(SessionStatus::Closed)
                    .assign(None)
                    .meta("conversationConcluded", serde_json::json!(true))
                    .touch(),
            )
            .unwrap();
        assert_eq!(s.status, SessionStatus::Closed);
        assert!(s.assigned_agent.is_none());
        assert!(s.conversation_concluded());
        // Earlier meta keys survive the merge
        assert_eq!(s.user_meta["assignedAgent"], "a1");
    }

    #[test]
    fn messages_keep_order() {
        let db = db();
        db.create_session("s1", &Map::new()).unwrap();
        for i in 0..5 {
            db.append_message(&NewMessage::new("s1", Sender::User, &format!("m{i}")))
                .unwrap();
        }
        let asc = db.list_messages("s1", 10, true).unwrap();
        assert_eq!(asc.len(), 5);
        assert_eq!(asc[0].text, "m0");
        assert_eq!(asc[4].text, "m4");

        let desc = db.list_messages("s1", 2, false).unwrap();
        assert_eq!(desc[0].text, "m4");
    }

    #[test]
    fn dialogue_window_excludes_internal_and_current_turn() {
        let db = db();
        db.create_session("s1", &Map::new()).unwrap();
        db.append_message(&NewMessage::new("s1", Sender::User, "hi"))
            .unwrap();
        db.append_message(&NewMessage::new("s1", Sender::Bot, "hello"))
            .unwrap();
        db.append_message(&NewMessage::new("s1", Sender::Internal, "note"))
            .unwrap();
        let current = db
            .append_message(&NewMessage::new("s1", Sender::User, "question"))
            .unwrap();

        let window = db.recent_dialogue("s1", 20, Some(&current.id)).unwrap();
        assert_eq!(window.len(), 2);
        assert!(window.iter().all(|m| m.visibility == Visibility::Public));
        assert_eq!(window[0].text, "hi");
        assert_eq!(window[1].text, "hello");
    }

    #[test]
    fn dialogue_window_is_bounded() {
        let db = db();
        db.create_session("s1", &Map::new()).unwrap();
        for i in 0..30 {
            db.append_message(&NewMessage::new("s1", Sender::User, &format!("m{i}")))
                .unwrap();
        }
        let window = db.recent_dialogue("s1", 20, None).unwrap();
        assert_eq!(window.len(), 20);
        // Newest 20, ascending
        assert_eq!(window[0].text, "m10");
        assert_eq!(window[19].text, "m29");
    }

    #[test]
    fn internal_sender_defaults_to_internal_visibility() {
        let m = NewMessage::new("s1", Sender::Internal, "note");
        assert_eq!(m.visibility, Visibility::Internal);
    }

    #[test]
    fn users_round_trip_roles() {
        let db = db();
        db.create_user("u1", "Ann", None, &[Role::Agent, Role::Admin], "online")
            .unwrap();
        let u = db.get_user("u1").unwrap();
        assert_eq!(u.roles, vec![Role::Agent, Role::Admin]);

        let agents = db.find_users_by_role(Role::Agent, 10).unwrap();
        assert_eq!(agents.len(), 1);
        let viewers = db.find_users_by_role(Role::Viewer, 10).unwrap();
        assert!(viewers.is_empty());
    }

    #[test]
    fn update_user_status_checks_existence() {
        let db = db();
        db.create_user("u1", "Ann", None, &[Role::Agent], "offline")
            .unwrap();
        db.update_user_status("u1", "online").unwrap();
        assert_eq!(db.get_user("u1").unwrap().status, "online");
        assert!(matches!(
            db.update_user_status("ghost", "online"),
            Err(DbError::UserNotFound(_))
        ));
    }

    #[test]
    fn accuracy_metadata_is_clamped_to_255() {
        let db = db();
        db.create_session("s1", &Map::new()).unwrap();
        let long = "x".repeat(400);
        db.create_accuracy_record(&NewAccuracyRecord {
            session_id: "s1".into(),
            text: "reply".into(),
            confidence: 0.9,
            latency_ms: 12,
            tokens: 8,
            response_type: ResponseType::Ai,
            metadata: Some(long),
        })
        .unwrap();
        let stored = db.last_accuracy_metadata("s1").unwrap();
        assert_eq!(stored.chars().count(), 255);
        assert!(stored.ends_with("..."));
    }

    #[test]
    fn settings_boundary_validation() {
        let db = db();
        assert!(db.set_setting(SETTING_CONTEXT_LIMIT, "1").is_err());
        assert!(db.set_setting(SETTING_CONTEXT_LIMIT, "51").is_err());
        assert!(db.set_setting(SETTING_CONTEXT_LIMIT, "abc").is_err());
        db.set_setting(SETTING_CONTEXT_LIMIT, "30").unwrap();
        assert_eq!(db.context_limit(), 30);

        let oversized = "y".repeat(5001);
        assert!(matches!(
            db.set_setting(SETTING_WELCOME_MESSAGE, &oversized),
            Err(DbError::InvalidSetting(_))
        ));
        assert_eq!(db.welcome_message(), DEFAULT_WELCOME_MESSAGE);

        db.set_setting(SETTING_WELCOME_MESSAGE, "Welcome!").unwrap();
        assert_eq!(db.welcome_message(), "Welcome!");
    }

    #[test]
    fn notification_record_round_trip() {
        let db = db();
        let n = db
            .create_notification(
                &NewNotification::new("request_agent", "Agent requested", "Visitor asked")
                    .for_session("s1"),
            )
            .unwrap();
        assert_eq!(n.kind, "request_agent");
        assert_eq!(n.session_id.as_deref(), Some("s1"));
        assert!(!n.read);
    }
}
