//! Agent-side connection handling
//!
//! Authentication, presence registration, takeover, agent messaging and
//! the grace-period disconnect. A reconnect inside the grace window is
//! invisible to the dashboard: the pending disconnect is cancelled and
//! no status change is broadcast.

use crate::auth::{AuthVerifier, Claims, Role};
use crate::db::{Database, NewMessage, NewNotification, Sender, SessionPatch, SessionStatus};
use crate::events::ServerEvent;
use crate::hub::{agent_room, Hub, ADMIN_FEED, ROOM_ADMIN, ROOM_AGENT};
use crate::notify::Notifier;
use crate::presence::PresenceRegistry;
use crate::session::AssignmentCache;
use std::sync::Arc;
use std::time::Duration;

/// Authenticated agent state held by a connection's read loop.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub user_id: String,
    pub claims: Claims,
}

/// Failed auth leaves the socket open briefly so the client can render
/// the error before the server hangs up.
const FAILED_AUTH_KICK_DELAY: Duration = Duration::from_secs(1);

pub struct AgentManager {
    db: Database,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    cache: Arc<AssignmentCache>,
    verifier: Arc<dyn AuthVerifier>,
    notifier: Arc<Notifier>,
}

impl AgentManager {
    pub fn new(
        db: Database,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        cache: Arc<AssignmentCache>,
        verifier: Arc<dyn AuthVerifier>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            db,
            hub,
            presence,
            cache,
            verifier,
            notifier,
        }
    }

    fn reject(&self, conn_id: &str, message: &str) {
        self.hub.emit_to(
            conn_id,
            &ServerEvent::AuthError {
                message: message.to_string(),
            },
        );
        let hub = self.hub.clone();
        let conn = conn_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(FAILED_AUTH_KICK_DELAY).await;
            hub.close_connection(&conn);
        });
    }

    /// `agent_auth` / `agent_connect`: verify the token, check the
    /// role, register presence and join the agent's rooms.
    pub fn handle_auth(
        &self,
        conn_id: &str,
        token: &str,
        agent_id_hint: Option<&str>,
    ) -> Option<AgentIdentity> {
        let claims = match self.verifier.verify(token) {
            Ok(claims) => claims,
            Err(e) => {
                tracing::info!(conn_id, error = %e, "Agent auth failed");
                self.reject(conn_id, "Authentication failed");
                return None;
            }
        };
        if !claims.has_at_least(Role::Agent) {
            self.reject(conn_id, "Agent role required");
            return None;
        }

        let agent_id = claims
            .agent_id
            .clone()
            .or_else(|| agent_id_hint.map(String::from))
            .unwrap_or_else(|| claims.user_id.clone());
        let user_id = claims.user_id.clone();

        let outcome = self.presence.register_agent(&agent_id, conn_id, &user_id);

        self.hub.join(conn_id, &agent_room(&agent_id));
        self.hub.join(conn_id, ROOM_AGENT);
        if claims.has_at_least(Role::Admin) {
            self.hub.join(conn_id, ROOM_ADMIN);
        }

        if outcome.is_first_registration() {
            if let Err(e) = self.db.update_user_status(&user_id, "online") {
                tracing::warn!(user_id, error = %e, "Failed to mark user online");
            }
            self.hub.emit_room(
                ADMIN_FEED,
                &ServerEvent::AgentConnected {
                    agent_id: agent_id.clone(),
                },
            );
            self.hub.emit_room(
                ADMIN_FEED,
                &ServerEvent::AgentStatusChanged {
                    agent_id: agent_id.clone(),
                    status: "online".to_string(),
                    action: "connected".to_string(),
                },
            );
            self.notifier.notify(NewNotification::new(
                "agent_connected",
                "Agent online",
                &format!("Agent {agent_id} connected"),
            ));
        } else {
            tracing::debug!(agent_id, reconnect = outcome.cancelled_pending, "Quiet re-registration");
        }

        self.hub.emit_to(
            conn_id,
            &ServerEvent::AuthSuccess {
                agent_id: agent_id.clone(),
                user_id: user_id.clone(),
            },
        );

        Some(AgentIdentity {
            agent_id,
            user_id,
            claims,
        })
    }

    /// Connection tear-down: start the grace timer. If the agent
    /// re-registers before it fires, nothing is broadcast.
    pub fn handle_disconnect(&self, conn_id: &str) {
        let Some(claim) = self.presence.begin_disconnect(conn_id) else {
            return;
        };
        tracing::debug!(agent_id = %claim.agent_id, "Agent connection closed, grace timer started");

        let db = self.db.clone();
        let hub = self.hub.clone();
        let presence = self.presence.clone();
        let notifier = self.notifier.clone();
        let grace = self.presence.grace_period();
        let attach_claim = claim.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(user_id) = presence.resolve_disconnect(&claim) else {
                // Reconnected inside the window; stay silent
                return;
            };
            if let Err(e) = db.update_user_status(&user_id, "offline") {
                tracing::warn!(user_id, error = %e, "Failed to mark user offline");
            }
            hub.emit_room(
                ADMIN_FEED,
                &ServerEvent::AgentStatusChanged {
                    agent_id: claim.agent_id.clone(),
                    status: "offline".to_string(),
                    action: "disconnected".to_string(),
                },
            );
            hub.emit_room(
                ADMIN_FEED,
                &ServerEvent::AgentDisconnected {
                    agent_id: claim.agent_id.clone(),
                    action: "disconnected".to_string(),
                },
            );
            notifier.notify(NewNotification::new(
                "agent_disconnected",
                "Agent offline",
                &format!("Agent {} disconnected", claim.agent_id),
            ));
        });
        // Hand the timer to the registry; if a reconnect already raced
        // us, the handle is aborted on the spot.
        self.presence
            .attach_grace_timer(&attach_claim, handle.abort_handle());
    }

    /// `agent_takeover`: assign the session to the agent; the AI is
    /// suppressed from here on. Reassignment of an already-assigned
    /// session is allowed.
    pub fn handle_takeover(&self, conn_id: &str, identity: &AgentIdentity, session_id: &str) {
        let session = match self.db.get_session(session_id) {
            Ok(session) => session,
            Err(_) => {
                self.hub.emit_to(
                    conn_id,
                    &ServerEvent::Error {
                        message: "Session not found".to_string(),
                    },
                );
                return;
            }
        };
        let permitted = session.status == SessionStatus::AgentAssigned
            || crate::session::transition_allowed(session.status, SessionStatus::AgentAssigned);
        if !permitted {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::Error {
                    message: "Session is closed".to_string(),
                },
            );
            return;
        }

        let patch = SessionPatch::default()
            .status(SessionStatus::AgentAssigned)
            .assign(Some(&identity.agent_id))
            .meta("assignedAgent", serde_json::json!(identity.agent_id))
            .touch();
        if let Err(e) = self.db.update_session(session_id, &patch) {
            tracing::warn!(session_id, error = %e, "Failed to persist takeover");
            self.hub.emit_to(
                conn_id,
                &ServerEvent::Error {
                    message: "Takeover failed".to_string(),
                },
            );
            return;
        }
        self.cache.invalidate(session_id);

        self.hub.join(conn_id, session_id);
        self.hub.emit_room(
            session_id,
            &ServerEvent::AgentJoined {
                session_id: session_id.to_string(),
                agent_id: identity.agent_id.clone(),
            },
        );

        // Targeted assignment notice for the agent's own room
        match self.db.create_notification(
            &NewNotification::new(
                "assignment",
                "Conversation assigned",
                &format!("You are now handling session {session_id}"),
            )
            .for_session(session_id)
            .for_user(&identity.user_id),
        ) {
            Ok(record) => {
                self.hub.emit_room(
                    &agent_room(&identity.agent_id),
                    &ServerEvent::NewNotification(record),
                );
            }
            Err(e) => tracing::warn!(session_id, error = %e, "Failed to record assignment"),
        }
    }

    pub fn handle_agent_message(
        &self,
        conn_id: &str,
        identity: &AgentIdentity,
        session_id: &str,
        text: &str,
        msg_type: Option<&str>,
        attachment_url: Option<&str>,
    ) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::SessionError {
                    message: "Message text is required".to_string(),
                },
            );
            return;
        }

        self.hub.join(conn_id, session_id);
        let mut record = NewMessage::new(session_id, Sender::Agent, trimmed)
            .with_agent(&identity.agent_id)
            .with_attachment(attachment_url.map(String::from));
        if let Some(t) = msg_type {
            record = record.with_type(t);
        }
        if let Err(e) = self.db.append_message(&record) {
            tracing::warn!(session_id, error = %e, "Failed to persist agent message");
        }
        if let Err(e) = self
            .db
            .update_session(session_id, &SessionPatch::default().touch())
        {
            tracing::debug!(session_id, error = %e, "Failed to touch session");
        }

        self.hub.emit_room(
            session_id,
            &ServerEvent::AgentMessage {
                session_id: session_id.to_string(),
                text: trimmed.to_string(),
                agent_id: identity.agent_id.clone(),
                sender: "agent".to_string(),
                attachment_url: attachment_url.map(String::from),
            },
        );
    }

    /// Internal notes live only in the session room and are stored with
    /// internal visibility; they never ride a visitor-facing channel.
    pub fn handle_internal_note(
        &self,
        conn_id: &str,
        identity: &AgentIdentity,
        session_id: &str,
        text: &str,
    ) {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return;
        }

        self.hub.join(conn_id, session_id);
        if let Err(e) = self.db.append_message(
            &NewMessage::new(session_id, Sender::Internal, trimmed).with_agent(&identity.agent_id),
        ) {
            tracing::warn!(session_id, error = %e, "Failed to persist internal note");
        }

        self.hub.emit_room(
            session_id,
            &ServerEvent::InternalNote {
                session_id: session_id.to_string(),
                text: trimmed.to_string(),
                agent_id: identity.agent_id.clone(),
                visibility: "internal".to_string(),
            },
        );
    }

    /// `join_admin_feed`: subscribe and push the current snapshot.
    pub fn handle_join_admin_feed(&self, conn_id: &str) {
        self.hub.join(conn_id, ADMIN_FEED);
        self.hub.emit_to(
            conn_id,
            &ServerEvent::LiveVisitorsUpdate(self.presence.snapshot_visitors()),
        );
    }
}
