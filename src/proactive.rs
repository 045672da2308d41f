//! Agent-initiated chats
//!
//! An agent opens a conversation with a live visitor. The server
//! generates the session id and it is authoritative; the widget joins
//! the room it is handed instead of creating its own session.

use crate::agents::AgentIdentity;
use crate::auth::Role;
use crate::db::{Database, NewMessage, Sender, SessionPatch, SessionStatus};
use crate::events::ServerEvent;
use crate::hub::Hub;
use crate::presence::PresenceRegistry;
use crate::session::AssignmentCache;
use std::sync::Arc;
use uuid::Uuid;

pub struct ProactiveOrchestrator {
    db: Database,
    hub: Arc<Hub>,
    presence: Arc<PresenceRegistry>,
    cache: Arc<AssignmentCache>,
}

/// Broadcast-visitors callback wiring lives with the caller; this
/// component only reports whether the visitor record changed.
pub struct InitiateOutcome {
    pub session_id: String,
    pub visitor_updated: bool,
}

impl ProactiveOrchestrator {
    pub fn new(
        db: Database,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        cache: Arc<AssignmentCache>,
    ) -> Self {
        Self {
            db,
            hub,
            presence,
            cache,
        }
    }

    /// `initiate_chat`: create the session, deliver the opening
    /// message to the target visitor only, and ack the agent.
    pub fn handle_initiate_chat(
        &self,
        conn_id: &str,
        identity: &AgentIdentity,
        target_connection_id: &str,
        message: &str,
        agent_id: &str,
    ) -> Option<InitiateOutcome> {
        // Target must be a live visitor
        if self.presence.get_visitor(target_connection_id).is_none() {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::Error {
                    message: "Visitor is no longer online".to_string(),
                },
            );
            return None;
        }

        if !identity.claims.has_at_least(Role::Agent) {
            self.hub.emit_to(
                conn_id,
                &ServerEvent::AuthError {
                    message: "Agent role required".to_string(),
                },
            );
            return None;
        }

        let agent_id = if agent_id.is_empty() {
            identity.agent_id.as_str()
        } else {
            agent_id
        };
        let session_id = format!("proactive-{}", Uuid::new_v4());

        // Session creation is a blocking precondition: unlike the hot
        // dispatch path, a failure here aborts and is surfaced.
        if let Err(e) = self.db.create_session(&session_id, &serde_json::Map::new()) {
            tracing::warn!(error = %e, "Failed to create proactive session");
            self.hub.emit_to(
                conn_id,
                &ServerEvent::Error {
                    message: "Could not start the chat".to_string(),
                },
            );
            return None;
        }
        if let Err(e) = self.db.update_session(
            &session_id,
            &SessionPatch::default()
                .status(SessionStatus::AgentAssigned)
                .assign(Some(agent_id))
                .meta("assignedAgent", serde_json::json!(agent_id))
                .meta("proactive", serde_json::json!(true)),
        ) {
            tracing::warn!(session_id, error = %e, "Failed to assign proactive session");
        }
        self.cache.invalidate(&session_id);

        if let Err(e) = self.db.append_message(
            &NewMessage::new(&session_id, Sender::Agent, message).with_agent(agent_id),
        ) {
            tracing::warn!(session_id, error = %e, "Failed to persist opening message");
        }

        // Both ends join the new room; the handshake itself goes only
        // to the target visitor's connection.
        self.hub.join(conn_id, &session_id);
        self.hub.join(target_connection_id, &session_id);
        self.hub.emit_to(
            target_connection_id,
            &ServerEvent::AgentInitiatedChat {
                session_id: session_id.clone(),
                text: message.to_string(),
                agent_id: agent_id.to_string(),
            },
        );

        let visitor_updated = self.presence.update_visitor(target_connection_id, |v| {
            v.status = Some("chatting".to_string());
            v.session_id = Some(session_id.clone());
        });

        self.hub.emit_to(
            conn_id,
            &ServerEvent::ChatInitiated {
                success: true,
                session_id: session_id.clone(),
            },
        );

        Some(InitiateOutcome {
            session_id,
            visitor_updated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Claims;
    use crate::hub::Frame;
    use crate::presence::Visitor;
    use chrono::Utc;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn identity() -> AgentIdentity {
        AgentIdentity {
            agent_id: "a1".to_string(),
            user_id: "u1".to_string(),
            claims: Claims {
                user_id: "u1".to_string(),
                agent_id: Some("a1".to_string()),
                roles: vec![Role::Agent],
                exp: Utc::now().timestamp() + 600,
            },
        }
    }

    struct Harness {
        db: Database,
        hub: Arc<Hub>,
        presence: Arc<PresenceRegistry>,
        orchestrator: ProactiveOrchestrator,
    }

    fn setup() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let hub = Arc::new(Hub::new());
        let presence = Arc::new(PresenceRegistry::new(Duration::from_secs(5)));
        let cache = Arc::new(AssignmentCache::new());
        let orchestrator =
            ProactiveOrchestrator::new(db.clone(), hub.clone(), presence.clone(), cache);
        Harness {
            db,
            hub,
            presence,
            orchestrator,
        }
    }

    fn connect(hub: &Hub, id: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(id, tx);
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Text(text) = frame {
                out.push(serde_json::from_str(&text).unwrap());
            }
        }
        out
    }

    fn named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
        events.iter().filter(|e| e["event"] == name).collect()
    }

    #[test]
    fn initiates_chat_with_live_visitor() {
        let h = setup();
        let mut visitor_rx = connect(&h.hub, "v1");
        let mut other_rx = connect(&h.hub, "v2");
        let mut agent_rx = connect(&h.hub, "c1");
        for conn in ["v1", "v2"] {
            h.presence.add_visitor(Visitor {
                connection_id: conn.to_string(),
                url: "/".to_string(),
                online_at: Utc::now(),
                status: Some("browsing".to_string()),
                session_id: None,
            });
        }

        let outcome = h
            .orchestrator
            .handle_initiate_chat("c1", &identity(), "v1", "Hi, need help choosing a plan?", "a1")
            .expect("chat initiated");

        // Delivered to the target connection only
        let visitor_events = drain(&mut visitor_rx);
        let handshake = named(&visitor_events, "agent_initiated_chat");
        assert_eq!(handshake.len(), 1);
        assert_eq!(handshake[0]["data"]["sessionId"], outcome.session_id.as_str());
        assert!(drain(&mut other_rx).is_empty());

        // Agent ack carries the authoritative session id
        let agent_events = drain(&mut agent_rx);
        let acks = named(&agent_events, "chat_initiated");
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0]["data"]["success"], true);
        assert_eq!(acks[0]["data"]["sessionId"], outcome.session_id.as_str());

        // Session exists, assigned, with the opening agent message
        let session = h.db.get_session(&outcome.session_id).unwrap();
        assert_eq!(session.status, SessionStatus::AgentAssigned);
        assert_eq!(session.assigned_agent.as_deref(), Some("a1"));
        let messages = h.db.list_messages(&outcome.session_id, 10, true).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, Sender::Agent);

        // Visitor record flipped to chatting
        assert!(outcome.visitor_updated);
        let v = h.presence.get_visitor("v1").unwrap();
        assert_eq!(v.status.as_deref(), Some("chatting"));
        assert_eq!(v.session_id.as_deref(), Some(outcome.session_id.as_str()));
    }

    #[test]
    fn missing_visitor_is_an_error() {
        let h = setup();
        let mut agent_rx = connect(&h.hub, "c1");

        let outcome = h
            .orchestrator
            .handle_initiate_chat("c1", &identity(), "ghost", "hello?", "a1");
        assert!(outcome.is_none());

        let events = drain(&mut agent_rx);
        assert_eq!(named(&events, "error").len(), 1);
        assert!(named(&events, "chat_initiated").is_empty());
    }
}
