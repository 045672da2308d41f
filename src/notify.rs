//! Notification records and role-room fan-out

use crate::auth::Role;
use crate::db::{Database, NewNotification, Notification};
use crate::events::ServerEvent;
use crate::hub::{Hub, ROOM_ADMIN, ROOM_AGENT};
use std::sync::Arc;

pub struct Notifier {
    db: Database,
    hub: Arc<Hub>,
}

impl Notifier {
    pub fn new(db: Database, hub: Arc<Hub>) -> Self {
        Self { db, hub }
    }

    /// Create a notification record and broadcast it to the admin and
    /// agent role rooms. A persistence failure is logged; the broadcast
    /// still happens with an unpersisted copy.
    pub fn notify(&self, n: NewNotification) {
        let record = self.db.create_notification(&n).unwrap_or_else(|e| {
            tracing::warn!(kind = %n.kind, error = %e, "Failed to persist notification");
            Notification {
                id: String::new(),
                kind: n.kind.clone(),
                title: n.title.clone(),
                body: n.body.clone(),
                severity: n.severity.clone(),
                user_id: n.user_id.clone(),
                session_id: n.session_id.clone(),
                read: false,
                created_at: chrono::Utc::now(),
            }
        });
        let event = ServerEvent::NewNotification(record);
        self.hub.emit_room(ROOM_ADMIN, &event);
        self.hub.emit_room(ROOM_AGENT, &event);
    }

    /// Enumerate users with each target role and create one record per
    /// recipient. Errors are isolated per recipient. Driven by the
    /// admin alerting surface.
    #[allow(dead_code)]
    pub fn broadcast_system_alert(
        &self,
        title: &str,
        body: &str,
        severity: &str,
        target_roles: &[Role],
    ) {
        for role in target_roles {
            let users = match self.db.find_users_by_role(*role, 500) {
                Ok(users) => users,
                Err(e) => {
                    tracing::warn!(role = role.as_str(), error = %e, "Role lookup failed");
                    continue;
                }
            };
            for user in users {
                let n = NewNotification::new("system_alert", title, body)
                    .with_severity(severity)
                    .for_user(&user.id);
                if let Err(e) = self.db.create_notification(&n) {
                    tracing::warn!(user_id = %user.id, error = %e, "Failed to create notification");
                }
            }
            let room = match role {
                Role::Admin | Role::SuperAdmin => ROOM_ADMIN,
                _ => ROOM_AGENT,
            };
            // Broadcast copy; per-user rows are already stored.
            self.hub.emit_room(
                room,
                &ServerEvent::NewNotification(Notification {
                    id: String::new(),
                    kind: "system_alert".to_string(),
                    title: title.to_string(),
                    body: body.to_string(),
                    severity: severity.to_string(),
                    user_id: None,
                    session_id: None,
                    read: false,
                    created_at: chrono::Utc::now(),
                }),
            );
        }
    }
}
