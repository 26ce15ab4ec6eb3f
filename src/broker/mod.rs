//! Broker-facing types: routing keys, event payloads, and the publisher seam.
//!
//! Routing keys are dot-separated, least to most specific:
//! `<domain>.<channel>.<event-kind>`. The relay consumes duel websocket
//! events plus any `*.*.notification` key, and publishes player lifecycle
//! and answer events.

pub mod client;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::RelayError;

pub use client::BrokerClient;

/// Topic exchange all duel-relay traffic flows through.
pub const EXCHANGE: &str = "duel.events";

/// Queue this instance consumes; messages expire via the configured TTL.
pub const EVENTS_QUEUE: &str = "websocket-events";

/// Routing keys consumed and published by the relay.
pub mod keys {
    /// Question pushed to a duel room.
    pub const DUEL_QUESTION: &str = "duel.websocket.question";
    /// Status update for a duel room.
    pub const DUEL_STATUS: &str = "duel.websocket.status";
    /// Final results for a duel room.
    pub const DUEL_RESULTS: &str = "duel.websocket.results";
    /// A participant came online in a room.
    pub const PLAYER_CONNECTED: &str = "duel.player.connected";
    /// A participant's room connection went away.
    pub const PLAYER_DISCONNECTED: &str = "duel.player.disconnected";
    /// A participant submitted an answer.
    pub const PLAYER_ANSWERED: &str = "duel.player.answered";

    /// Binding patterns for the events queue.
    pub const BIND_DUEL_WEBSOCKET: &str = "duel.websocket.*";
    pub const BIND_NOTIFICATIONS: &str = "*.*.notification";

    /// Suffix shared by every per-user notification key.
    pub const NOTIFICATION_SUFFIX: &str = ".notification";
}

/// Body of a `duel.websocket.*` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuelEvent {
    #[serde(rename = "duelId")]
    pub duel_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Body of a `*.*.notification` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Body of `duel.player.connected` / `duel.player.disconnected`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerEvent {
    #[serde(rename = "duelId")]
    pub duel_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
}

/// Body of `duel.player.answered`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerEvent {
    #[serde(rename = "duelId")]
    pub duel_id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub answer: Value,
}

/// Publish seam between the dispatcher and the broker.
///
/// The lapin client implements this for production; tests substitute a
/// recording stub. Publishes are never retried here — the caller owns retry
/// policy, since blind retries without idempotency keys duplicate side
/// effects downstream.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, routing_key: &str, payload: Value) -> Result<(), RelayError>;
}

/// Shared up/down flag for the broker link, read by the health endpoint and
/// written by the client's supervisor task.
#[derive(Clone, Default)]
pub struct BrokerHealth(Arc<AtomicBool>);

impl BrokerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_up(&self, up: bool) {
        self.0.store(up, Ordering::Relaxed);
    }

    pub fn is_up(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
