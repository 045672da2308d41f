//! Connection hub: per-connection senders and room fan-out
//!
//! Rooms in use: `{sessionId}` per conversation, `admin_feed` for the
//! dashboard, `agents:{agentId}` for targeted agent delivery, and the
//! role rooms `admin` / `agent`. An event is serialized once per
//! emission and the frame is cloned into each member's writer queue.

use crate::events::ServerEvent;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::mpsc;

pub const ADMIN_FEED: &str = "admin_feed";
pub const ROOM_ADMIN: &str = "admin";
pub const ROOM_AGENT: &str = "agent";

pub fn agent_room(agent_id: &str) -> String {
    format!("agents:{agent_id}")
}

/// Frames pushed to a connection's writer task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    /// Ask the writer to close the socket (delayed auth kick).
    Close,
}

pub type ConnSender = mpsc::UnboundedSender<Frame>;

#[derive(Default)]
struct Inner {
    conns: HashMap<String, ConnSender>,
    rooms: HashMap<String, HashSet<String>>,
    memberships: HashMap<String, HashSet<String>>,
}

#[derive(Default)]
pub struct Hub {
    inner: Mutex<Inner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&self, conn_id: &str, sender: ConnSender) {
        let mut inner = self.inner.lock().unwrap();
        inner.conns.insert(conn_id.to_string(), sender);
    }

    /// Drop the connection and leave every room it joined.
    pub fn disconnect(&self, conn_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.conns.remove(conn_id);
        if let Some(rooms) = inner.memberships.remove(conn_id) {
            for room in rooms {
                if let Some(members) = inner.rooms.get_mut(&room) {
                    members.remove(conn_id);
                    if members.is_empty() {
                        inner.rooms.remove(&room);
                    }
                }
            }
        }
    }

    pub fn join(&self, conn_id: &str, room: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.conns.contains_key(conn_id) {
            return;
        }
        inner
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(conn_id.to_string());
        inner
            .memberships
            .entry(conn_id.to_string())
            .or_default()
            .insert(room.to_string());
    }

    pub fn leave(&self, conn_id: &str, room: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(members) = inner.rooms.get_mut(room) {
            members.remove(conn_id);
            if members.is_empty() {
                inner.rooms.remove(room);
            }
        }
        if let Some(rooms) = inner.memberships.get_mut(conn_id) {
            rooms.remove(room);
        }
    }

    /// Emit to every member of a room. Dead senders are skipped; their
    /// connections are reaped by their own read loops.
    pub fn emit_room(&self, room: &str, event: &ServerEvent) {
        let frame = event.frame();
        let inner = self.inner.lock().unwrap();
        let Some(members) = inner.rooms.get(room) else {
            return;
        };
        tracing::trace!(room, event = event.name(), members = members.len(), "emit");
        for conn_id in members {
            if let Some(sender) = inner.conns.get(conn_id) {
                let _ = sender.send(Frame::Text(frame.clone()));
            }
        }
    }

    /// Emit to a single connection; false when it is gone.
    pub fn emit_to(&self, conn_id: &str, event: &ServerEvent) -> bool {
        let frame = event.frame();
        let inner = self.inner.lock().unwrap();
        match inner.conns.get(conn_id) {
            Some(sender) => sender.send(Frame::Text(frame)).is_ok(),
            None => false,
        }
    }

    /// Ask a connection's writer to close the socket.
    pub fn close_connection(&self, conn_id: &str) {
        let inner = self.inner.lock().unwrap();
        if let Some(sender) = inner.conns.get(conn_id) {
            let _ = sender.send(Frame::Close);
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_connected(&self, conn_id: &str) -> bool {
        self.inner.lock().unwrap().conns.contains_key(conn_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn attach(hub: &Hub, conn: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (tx, rx) = mpsc::unbounded_channel();
        hub.connect(conn, tx);
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

    #[test]
    fn room_emit_reaches_members_only() {
        let hub = Hub::new();
        let mut a = attach(&hub, "a");
        let mut b = attach(&hub, "b");
        hub.join("a", "s1");

        hub.emit_room(
            "s1",
            &ServerEvent::SessionStarted {
                session_id: "s1".into(),
            },
        );

        assert_eq!(drain(&mut a).len(), 1);
        assert!(drain(&mut b).is_empty());
    }

    #[test]
    fn disconnect_leaves_rooms() {
        let hub = Hub::new();
        let mut a = attach(&hub, "a");
        hub.join("a", "s1");
        hub.disconnect("a");
        hub.emit_room(
            "s1",
            &ServerEvent::SessionStarted {
                session_id: "s1".into(),
            },
        );
        assert!(drain(&mut a).is_empty());
        assert!(!hub.is_connected("a"));
    }

    #[test]
    fn emit_to_unknown_is_false() {
        let hub = Hub::new();
        assert!(!hub.emit_to("ghost", &ServerEvent::Error { message: "x".into() }));
    }

    #[test]
    fn join_requires_live_connection() {
        let hub = Hub::new();
        hub.join("ghost", "s1");
        // Emission into the room must not panic and reaches no one
        hub.emit_room(
            "s1",
            &ServerEvent::SessionStarted {
                session_id: "s1".into(),
            },
        );
    }
}
