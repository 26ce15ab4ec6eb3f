//! The dispatcher: decides, for each inbound broker or client message,
//! which registry entries to notify and what broker event to emit.
//!
//! Broker events fan out to rooms or identities; client frames either
//! republish to the broker (answers) or are answered locally (ping). All
//! malformed input is logged and dropped — nothing here may take down the
//! handling task.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;

use crate::broker::{keys, AnswerEvent, DuelEvent, EventPublisher, NotificationEvent, PlayerEvent};
use crate::cache::{CacheClient, ChannelKind, RoomStateRecord, SessionRecord};
use crate::registry::{ConnectionRegistry, ConnectionSender};
use crate::ws::protocol::{ClientMessage, ServerMessage};
use crate::ws::ConnectionContext;

pub struct Dispatcher {
    registry: ConnectionRegistry,
    publisher: Arc<dyn EventPublisher>,
    cache: CacheClient,
}

impl Dispatcher {
    pub fn new(
        registry: ConnectionRegistry,
        publisher: Arc<dyn EventPublisher>,
        cache: CacheClient,
    ) -> Self {
        Self {
            registry,
            publisher,
            cache,
        }
    }

    /// Route one consumed broker message by its exact routing key.
    ///
    /// Duel websocket events broadcast to the room; notification events go
    /// to the identity's connections and are dropped if none are live (no
    /// queued delivery). Unknown keys are dropped at debug level — the
    /// event-kind space is an open enumeration.
    pub async fn dispatch_broker(&self, routing_key: &str, body: &[u8]) {
        match routing_key {
            keys::DUEL_QUESTION => {
                if let Some(event) = decode::<DuelEvent>(routing_key, body) {
                    let sent = self
                        .registry
                        .broadcast_to_room(&event.duel_id, &ServerMessage::Question { data: event.data });
                    self.touch_room(&event.duel_id).await;
                    tracing::debug!(duel_id = %event.duel_id, sent, "Question broadcast");
                }
            }
            keys::DUEL_STATUS => {
                if let Some(event) = decode::<DuelEvent>(routing_key, body) {
                    let sent = self
                        .registry
                        .broadcast_to_room(&event.duel_id, &ServerMessage::Status { data: event.data });
                    self.touch_room(&event.duel_id).await;
                    tracing::debug!(duel_id = %event.duel_id, sent, "Status broadcast");
                }
            }
            keys::DUEL_RESULTS => {
                if let Some(event) = decode::<DuelEvent>(routing_key, body) {
                    let sent = self
                        .registry
                        .broadcast_to_room(&event.duel_id, &ServerMessage::DuelEnd { data: event.data });
                    tracing::debug!(duel_id = %event.duel_id, sent, "Duel end broadcast");
                }
            }
            key if key.ends_with(keys::NOTIFICATION_SUFFIX) => {
                if let Some(event) = decode::<NotificationEvent>(routing_key, body) {
                    let sent = self
                        .registry
                        .send_to_identity(&event.user_id, &ServerMessage::Notification { data: event.data });
                    if sent == 0 {
                        tracing::debug!(user_id = %event.user_id, "Notification dropped, no live connection");
                    }
                }
            }
            other => {
                tracing::debug!(routing_key = %other, "Unhandled routing key");
            }
        }
    }

    /// Handle one raw text frame from a connected client.
    pub async fn dispatch_client(&self, ctx: &ConnectionContext, raw: &str, reply: &ConnectionSender) {
        let message: ClientMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(user_id = %ctx.user_id, error = %e, "Malformed client frame dropped");
                return;
            }
        };

        match message {
            ClientMessage::Ping => {
                // Latency-sensitive keepalive: answered locally, never via
                // the broker.
                if let Some(frame) = ServerMessage::Pong.to_frame() {
                    let _ = reply.send(frame);
                }
            }
            ClientMessage::Answer { data } => {
                let Some(duel_id) = ctx.duel_id.as_deref() else {
                    tracing::warn!(user_id = %ctx.user_id, "Answer on a non-duel connection dropped");
                    return;
                };

                let event = AnswerEvent {
                    duel_id: duel_id.to_string(),
                    user_id: ctx.user_id.clone(),
                    answer: data,
                };
                self.publish_logged(keys::PLAYER_ANSWERED, &event).await;
            }
        }
    }

    /// Called after a connection is admitted: refresh the advisory session
    /// record, and for room connections also refresh the room record and
    /// announce the participant.
    pub async fn connection_opened(&self, ctx: &ConnectionContext) {
        let record = SessionRecord {
            user_id: ctx.user_id.clone(),
            channel: if ctx.duel_id.is_some() {
                ChannelKind::Duel
            } else {
                ChannelKind::Notification
            },
            status: "connected".to_string(),
            connected_at: Utc::now(),
        };
        if let Err(e) = self.cache.store_session(&record).await {
            tracing::warn!(user_id = %ctx.user_id, error = %e, "Session cache write failed");
        }

        if let Some(duel_id) = ctx.duel_id.as_deref() {
            self.touch_room(duel_id).await;
            let event = PlayerEvent {
                duel_id: duel_id.to_string(),
                user_id: ctx.user_id.clone(),
            };
            self.publish_logged(keys::PLAYER_CONNECTED, &event).await;
        }
    }

    /// Called on every connection exit path, after registry cleanup.
    pub async fn connection_closed(&self, ctx: &ConnectionContext) {
        // Other tabs may still hold connections for this user; the session
        // record stays until the last one goes.
        if !self.registry.has_identity(&ctx.user_id) {
            if let Err(e) = self.cache.delete_session(&ctx.user_id).await {
                tracing::warn!(user_id = %ctx.user_id, error = %e, "Session cache delete failed");
            }
        }

        if let Some(duel_id) = ctx.duel_id.as_deref() {
            let remaining = self.registry.room_participants(duel_id);
            if remaining.is_empty() {
                if let Err(e) = self.cache.delete_room_state(duel_id).await {
                    tracing::warn!(duel_id = %duel_id, error = %e, "Room cache delete failed");
                }
            } else {
                self.touch_room(duel_id).await;
            }

            // Last-connection-wins: a replaced connection's teardown finds
            // the participant still in the room through its newer
            // connection, and must not announce a departure.
            if remaining.iter().any(|p| p == &ctx.user_id) {
                tracing::debug!(
                    duel_id = %duel_id,
                    user_id = %ctx.user_id,
                    "Participant still connected, no disconnect event"
                );
            } else {
                let event = PlayerEvent {
                    duel_id: duel_id.to_string(),
                    user_id: ctx.user_id.clone(),
                };
                self.publish_logged(keys::PLAYER_DISCONNECTED, &event).await;
            }
        }
    }

    /// Refresh the advisory room record from the registry's current view.
    async fn touch_room(&self, duel_id: &str) {
        let participants = self.registry.room_participants(duel_id);
        if participants.is_empty() {
            return;
        }

        let record = RoomStateRecord {
            duel_id: duel_id.to_string(),
            participants,
            status: "active".to_string(),
            last_activity: Utc::now(),
        };
        if let Err(e) = self.cache.store_room_state(&record).await {
            tracing::warn!(duel_id = %duel_id, error = %e, "Room cache write failed");
        }
    }

    /// Publish, surfacing failure in the log. Lifecycle events are
    /// fire-and-forget; answers likewise — retrying without idempotency
    /// keys would duplicate downstream side effects.
    async fn publish_logged<T: serde::Serialize>(&self, routing_key: &str, event: &T) {
        let payload = match serde_json::to_value(event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(routing_key = %routing_key, error = %e, "Failed to encode broker event");
                return;
            }
        };

        if let Err(e) = self.publisher.publish(routing_key, payload).await {
            tracing::error!(routing_key = %routing_key, error = %e, "Broker publish failed");
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(routing_key: &str, body: &[u8]) -> Option<T> {
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(routing_key = %routing_key, error = %e, "Malformed broker message dropped");
            None
        }
    }
}
