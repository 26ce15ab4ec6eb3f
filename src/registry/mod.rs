//! In-memory connection registry.
//!
//! Maps logical identities (user id, duel id) to live WebSocket connections.
//! A user may hold several connections at once (multiple tabs/devices); a
//! duel room holds at most one connection per participant. The registry is
//! the authoritative source of presence — the redis cache is only an
//! advisory mirror of it.
//!
//! Senders are the mpsc halves feeding each connection's writer task, so a
//! failed send means the connection is gone and the entry is pruned on the
//! spot. Fan-out never aborts on a single dead connection.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::ws::protocol::ServerMessage;

/// Sender half of a connection's outbound channel. Cloning it lets any task
/// push frames to that client; the writer task owns the socket sink.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;

/// Registry of live connections, shared across all handler and consumer tasks.
///
/// Invariants:
/// - a user id key exists iff its connection set is non-empty
/// - a room exists iff it has at least one connected participant
/// - a participant appears at most once per room (last connection wins)
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    /// user_id -> all of that user's notification connections
    connections: Arc<DashMap<String, Vec<ConnectionSender>>>,
    /// duel_id -> participant user_id -> that participant's connection
    rooms: Arc<DashMap<String, HashMap<String, ConnectionSender>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a notification connection for a user. A user may register any
    /// number of distinct connections.
    pub fn register_notification(&self, user_id: &str, sender: ConnectionSender) {
        self.connections
            .entry(user_id.to_string())
            .or_default()
            .push(sender);

        let count = self
            .connections
            .get(user_id)
            .map(|v| v.len())
            .unwrap_or(0);
        tracing::debug!(user_id = %user_id, connections = count, "Notification connection registered");
    }

    /// Add a participant connection to a duel room, replacing any previous
    /// connection that participant had in the room.
    ///
    /// Authorization happens before this call, at the upgrade boundary.
    pub fn register_room(&self, duel_id: &str, user_id: &str, sender: ConnectionSender) {
        let replaced = self
            .rooms
            .entry(duel_id.to_string())
            .or_default()
            .insert(user_id.to_string(), sender)
            .is_some();

        tracing::debug!(duel_id = %duel_id, user_id = %user_id, replaced, "Room connection registered");
    }

    /// Remove one of a user's notification connections. Idempotent: calling
    /// again with the same sender is a no-op. Dead senders found along the
    /// way are pruned too, and the user key is dropped once its set empties.
    pub fn unregister_notification(&self, user_id: &str, sender: &ConnectionSender) {
        let mut drop_user = false;

        if let Some(mut entry) = self.connections.get_mut(user_id) {
            entry.retain(|s| !s.same_channel(sender) && !s.is_closed());
            if entry.is_empty() {
                drop_user = true;
            }
        }

        if drop_user {
            // Re-check under the removal lock: a concurrent register may
            // have refilled the set since we released the entry.
            self.connections.remove_if(user_id, |_, v| v.is_empty());
        }

        tracing::debug!(user_id = %user_id, "Notification connection unregistered");
    }

    /// Remove a participant's connection from a room. Idempotent, and a
    /// no-op if the stored connection is not the one given — so an old
    /// actor's cleanup cannot evict the connection that replaced it.
    pub fn unregister_room(&self, duel_id: &str, user_id: &str, sender: &ConnectionSender) {
        let mut drop_room = false;

        if let Some(mut entry) = self.rooms.get_mut(duel_id) {
            let matches = entry
                .get(user_id)
                .map(|s| s.same_channel(sender))
                .unwrap_or(false);
            if matches {
                entry.remove(user_id);
            }
            if entry.is_empty() {
                drop_room = true;
            }
        }

        if drop_room {
            self.rooms.remove_if(duel_id, |_, m| m.is_empty());
        }

        tracing::debug!(duel_id = %duel_id, user_id = %user_id, "Room connection unregistered");
    }

    /// Deliver a message to every live connection of a user.
    ///
    /// Returns the number of connections reached. Connections whose channel
    /// is gone are removed as a side effect. Unknown users yield 0.
    pub fn send_to_identity(&self, user_id: &str, message: &ServerMessage) -> usize {
        let Some(frame) = message.to_frame() else {
            return 0;
        };

        let mut delivered = 0;
        let mut drop_user = false;

        if let Some(mut entry) = self.connections.get_mut(user_id) {
            entry.retain(|sender| {
                if sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
            if entry.is_empty() {
                drop_user = true;
            }
        }

        if drop_user {
            self.connections.remove_if(user_id, |_, v| v.is_empty());
        }

        delivered
    }

    /// Deliver a message to every participant of a room.
    ///
    /// Returns the number of participants reached. A failed send evicts only
    /// that participant; the rest of the fan-out continues.
    pub fn broadcast_to_room(&self, duel_id: &str, message: &ServerMessage) -> usize {
        let Some(frame) = message.to_frame() else {
            return 0;
        };

        let mut delivered = 0;
        let mut drop_room = false;

        if let Some(mut entry) = self.rooms.get_mut(duel_id) {
            entry.retain(|_, sender| {
                if sender.send(frame.clone()).is_ok() {
                    delivered += 1;
                    true
                } else {
                    false
                }
            });
            if entry.is_empty() {
                drop_room = true;
            }
        }

        if drop_room {
            self.rooms.remove_if(duel_id, |_, m| m.is_empty());
        }

        delivered
    }

    /// Participants currently registered in a room.
    pub fn room_participants(&self, duel_id: &str) -> Vec<String> {
        self.rooms
            .get(duel_id)
            .map(|entry| entry.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Total live notification connections, across all users.
    pub fn connection_count(&self) -> usize {
        self.connections.iter().map(|e| e.value().len()).sum()
    }

    /// Number of rooms with at least one participant.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Whether a user has at least one notification connection.
    pub fn has_identity(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }
}
