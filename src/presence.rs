//! In-memory presence: live visitors, agent connections, grace timers
//!
//! The registry is the exclusive owner of its maps; every read and
//! write takes the single lock. Grace-period disconnects are recorded
//! here as pending entries carrying a one-shot token: the fired timer
//! must take back the entry with the same token before any offline
//! broadcast, and re-registration removes the entry first, so a
//! reconnect can never leak a status change.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::AbortHandle;
use uuid::Uuid;

/// Anonymous live page-view, keyed by connection id. Not persisted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Visitor {
    pub connection_id: String,
    pub url: String,
    pub online_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentPresence {
    pub agent_id: String,
    pub connection_id: String,
    pub user_id: String,
}

/// Result of [`PresenceRegistry::register_agent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterOutcome {
    /// The same connection was already registered for this agent.
    pub same_connection: bool,
    /// A different live connection was replaced.
    pub is_replacement: bool,
    /// A running grace timer was cancelled: this is a reconnect.
    pub cancelled_pending: bool,
}

impl RegisterOutcome {
    /// First-time registrations (and only those) broadcast presence.
    pub fn is_first_registration(&self) -> bool {
        !self.same_connection && !self.is_replacement && !self.cancelled_pending
    }
}

/// Claim produced by [`PresenceRegistry::begin_disconnect`]; the timer
/// that owns it must present the token back to finish the disconnect.
#[derive(Debug, Clone)]
pub struct DisconnectClaim {
    pub agent_id: String,
    pub user_id: String,
    pub token: Uuid,
}

struct PendingDisconnect {
    user_id: String,
    token: Uuid,
    abort: Option<AbortHandle>,
}

#[derive(Default)]
struct Inner {
    agent_by_conn: HashMap<String, String>,
    conn_by_agent: HashMap<String, AgentPresence>,
    visitors: HashMap<String, Visitor>,
    pending: HashMap<String, PendingDisconnect>,
}

pub struct PresenceRegistry {
    inner: Mutex<Inner>,
    grace: Duration,
}

impl PresenceRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            grace,
        }
    }

    /// The reconnect grace window.
    pub fn grace_period(&self) -> Duration {
        self.grace
    }

    // ---- agents ----

    /// Bind `agent_id` to `conn_id`, replacing any prior binding and
    /// cancelling a running grace timer.
    pub fn register_agent(&self, agent_id: &str, conn_id: &str, user_id: &str) -> RegisterOutcome {
        let mut inner = self.inner.lock().unwrap();

        let cancelled_pending = match inner.pending.remove(agent_id) {
            Some(p) => {
                if let Some(abort) = p.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        };

        let (same_connection, is_replacement) = match inner.conn_by_agent.get(agent_id) {
            Some(existing) if existing.connection_id == conn_id => (true, false),
            Some(existing) => {
                let stale = existing.connection_id.clone();
                inner.agent_by_conn.remove(&stale);
                (false, true)
            }
            None => (false, false),
        };

        inner
            .agent_by_conn
            .insert(conn_id.to_string(), agent_id.to_string());
        inner.conn_by_agent.insert(
            agent_id.to_string(),
            AgentPresence {
                agent_id: agent_id.to_string(),
                connection_id: conn_id.to_string(),
                user_id: user_id.to_string(),
            },
        );

        RegisterOutcome {
            same_connection,
            is_replacement,
            cancelled_pending,
        }
    }

    /// Connection id currently bound to an agent, if any.
    pub fn agent_connection(&self, agent_id: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .conn_by_agent
            .get(agent_id)
            .map(|p| p.connection_id.clone())
    }

    /// Tear-down entry point: unbind the connection and open a pending
    /// disconnect. Returns `None` when the connection was not the
    /// agent's current one (already replaced by a newer login).
    pub fn begin_disconnect(&self, conn_id: &str) -> Option<DisconnectClaim> {
        let mut inner = self.inner.lock().unwrap();
        let agent_id = inner.agent_by_conn.remove(conn_id)?;

        match inner.conn_by_agent.get(&agent_id) {
            Some(p) if p.connection_id == conn_id => {}
            _ => return None,
        }
        let record = inner.conn_by_agent.remove(&agent_id)?;

        let token = Uuid::new_v4();
        inner.pending.insert(
            record.agent_id.clone(),
            PendingDisconnect {
                user_id: record.user_id.clone(),
                token,
                abort: None,
            },
        );

        Some(DisconnectClaim {
            agent_id: record.agent_id,
            user_id: record.user_id,
            token,
        })
    }

    /// Attach the grace timer's abort handle to its pending entry. If
    /// the entry is already gone (reconnected meanwhile), the timer is
    /// aborted immediately.
    pub fn attach_grace_timer(&self, claim: &DisconnectClaim, abort: AbortHandle) {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.get_mut(&claim.agent_id) {
            Some(p) if p.token == claim.token => p.abort = Some(abort),
            _ => abort.abort(),
        }
    }

    /// Called by the fired timer: take the pending entry if it is still
    /// this timer's. `None` means a reconnect won the race.
    pub fn resolve_disconnect(&self, claim: &DisconnectClaim) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.get(&claim.agent_id) {
            Some(p) if p.token == claim.token => {
                let p = inner.pending.remove(&claim.agent_id).unwrap();
                Some(p.user_id)
            }
            _ => None,
        }
    }

    /// Cancel a pending disconnect without re-registering.
    #[allow(dead_code)] // API completeness; register_agent covers the hot path
    pub fn cancel_pending_disconnect(&self, agent_id: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.pending.remove(agent_id) {
            Some(p) => {
                if let Some(abort) = p.abort {
                    abort.abort();
                }
                true
            }
            None => false,
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn has_pending_disconnect(&self, agent_id: &str) -> bool {
        self.inner.lock().unwrap().pending.contains_key(agent_id)
    }

    // ---- visitors ----

    pub fn add_visitor(&self, visitor: Visitor) {
        let mut inner = self.inner.lock().unwrap();
        inner.visitors.insert(visitor.connection_id.clone(), visitor);
    }

    pub fn remove_visitor(&self, conn_id: &str) -> Option<Visitor> {
        self.inner.lock().unwrap().visitors.remove(conn_id)
    }

    pub fn get_visitor(&self, conn_id: &str) -> Option<Visitor> {
        self.inner.lock().unwrap().visitors.get(conn_id).cloned()
    }

    /// Apply a mutation to one visitor record; true when it existed.
    pub fn update_visitor(&self, conn_id: &str, f: impl FnOnce(&mut Visitor)) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.visitors.get_mut(conn_id) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all live visitors, oldest first.
    pub fn snapshot_visitors(&self) -> Vec<Visitor> {
        let inner = self.inner.lock().unwrap();
        let mut all: Vec<Visitor> = inner.visitors.values().cloned().collect();
        all.sort_by(|a, b| a.online_at.cmp(&b.online_at));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(5))
    }

    fn visitor(conn: &str) -> Visitor {
        Visitor {
            connection_id: conn.to_string(),
            url: "/pricing".to_string(),
            online_at: Utc::now(),
            status: Some("browsing".to_string()),
            session_id: None,
        }
    }

    #[test]
    fn first_registration() {
        let reg = registry();
        let out = reg.register_agent("a1", "c1", "u1");
        assert!(out.is_first_registration());
        assert_eq!(reg.agent_connection("a1").as_deref(), Some("c1"));
    }

    #[test]
    fn re_register_same_connection_is_idempotent() {
        let reg = registry();
        reg.register_agent("a1", "c1", "u1");
        let out = reg.register_agent("a1", "c1", "u1");
        assert!(out.same_connection);
        assert!(!out.is_first_registration());
        assert_eq!(reg.agent_connection("a1").as_deref(), Some("c1"));
    }

    #[test]
    fn replacement_unbinds_old_connection() {
        let reg = registry();
        reg.register_agent("a1", "c1", "u1");
        let out = reg.register_agent("a1", "c2", "u1");
        assert!(out.is_replacement);
        assert_eq!(reg.agent_connection("a1").as_deref(), Some("c2"));
        // The stale connection no longer claims the agent
        assert!(reg.begin_disconnect("c1").is_none());
    }

    #[test]
    fn reconnect_within_grace_cancels_pending() {
        let reg = registry();
        reg.register_agent("a1", "c1", "u1");
        let claim = reg.begin_disconnect("c1").expect("claim");
        assert!(reg.has_pending_disconnect("a1"));

        let out = reg.register_agent("a1", "c2", "u1");
        assert!(out.cancelled_pending);
        assert!(!out.is_first_registration());
        assert!(!reg.has_pending_disconnect("a1"));
        // The stale timer finds nothing to resolve
        assert!(reg.resolve_disconnect(&claim).is_none());
    }

    #[test]
    fn resolve_takes_the_claim_exactly_once() {
        let reg = registry();
        reg.register_agent("a1", "c1", "u1");
        let claim = reg.begin_disconnect("c1").expect("claim");
        assert_eq!(reg.resolve_disconnect(&claim).as_deref(), Some("u1"));
        assert!(reg.resolve_disconnect(&claim).is_none());
    }

    #[test]
    fn cancel_pending_is_boolean() {
        let reg = registry();
        reg.register_agent("a1", "c1", "u1");
        reg.begin_disconnect("c1").unwrap();
        assert!(reg.cancel_pending_disconnect("a1"));
        assert!(!reg.cancel_pending_disconnect("a1"));
    }

    #[test]
    fn visitor_snapshot_sorted_and_updatable() {
        let reg = registry();
        reg.add_visitor(visitor("v1"));
        reg.add_visitor(visitor("v2"));
        assert!(reg.update_visitor("v1", |v| v.status = Some("chatting".into())));
        let snap = reg.snapshot_visitors();
        assert_eq!(snap.len(), 2);
        assert!(!reg.update_visitor("nope", |_| {}));
        assert!(reg.remove_visitor("v1").is_some());
        assert_eq!(reg.snapshot_visitors().len(), 1);
    }
}
