//! Session status rules and the hot assignment cache
//!
//! The repository stays authoritative; the cache mirrors
//! `status`/`assigned_agent` for the dispatcher's per-message check and
//! is invalidated on assignment, close and reopen.

use crate::db::{Session, SessionStatus};
use std::collections::HashMap;
use std::sync::Mutex;

/// Cached per-session assignment state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Assignment {
    pub agent_id: Option<String>,
    pub ai_paused: bool,
}

impl Assignment {
    /// `ai_paused` is derived: an agent holds the session when it is
    /// agent_assigned or carries an assignee.
    pub fn from_session(session: &Session) -> Self {
        let ai_paused = session.status == SessionStatus::AgentAssigned
            || session.assigned_agent.is_some();
        Self {
            agent_id: session.assigned_agent.clone(),
            ai_paused,
        }
    }
}

/// Legal status transitions. `agent_assigned` never returns to
/// `active` within the same session; reopening a closed session yields
/// a fresh `active` state with the assignment cleared.
pub fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus::{Active, AgentAssigned, Closed};
    matches!(
        (from, to),
        (Active, AgentAssigned) | (Active, Closed) | (AgentAssigned, Closed) | (Closed, Active)
    )
}

#[derive(Default)]
pub struct AssignmentCache {
    inner: Mutex<HashMap<String, Assignment>>,
}

impl AssignmentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Assignment> {
        self.inner.lock().unwrap().get(session_id).cloned()
    }

    /// Read-through warm from a freshly loaded session row.
    pub fn warm(&self, session: &Session) -> Assignment {
        let assignment = Assignment::from_session(session);
        self.inner
            .lock()
            .unwrap()
            .insert(session.id.clone(), assignment.clone());
        assignment
    }

    pub fn invalidate(&self, session_id: &str) {
        self.inner.lock().unwrap().remove(session_id);
    }
}
