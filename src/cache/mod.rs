//! Advisory session and room-state cache on redis.
//!
//! Every record carries a TTL and expires on its own; nothing here is
//! load-bearing for message delivery. The registry is the authoritative
//! presence source — cache records only give sibling processes a hint of
//! who is connected where. Callers log write failures and carry on.

use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::RelayError;

/// Which endpoint a session is connected through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Notification,
    Duel,
}

/// Cross-process hint that a user currently holds a connection here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub channel: ChannelKind,
    pub status: String,
    #[serde(rename = "connectedAt")]
    pub connected_at: DateTime<Utc>,
}

/// Cross-process hint of a duel room's live membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomStateRecord {
    #[serde(rename = "duelId")]
    pub duel_id: String,
    pub participants: Vec<String>,
    pub status: String,
    #[serde(rename = "lastActivity")]
    pub last_activity: DateTime<Utc>,
}

fn session_key(user_id: &str) -> String {
    format!("session:{user_id}")
}

fn room_key(duel_id: &str) -> String {
    format!("duel:{duel_id}")
}

/// Store behind the cache client.
///
/// `Memory` keeps records in-process, with no TTL enforcement — used by
/// tests and usable as a single-instance fallback. `Disabled` makes every
/// operation report `CacheDisabled` for the caller to log.
#[derive(Clone)]
enum Backend {
    Disabled,
    Memory(Arc<Mutex<HashMap<String, String>>>),
    Redis(ConnectionManager),
}

/// Thin async wrapper over redis with JSON values and TTL'd writes.
///
/// `ConnectionManager` reconnects on its own; a relay running without redis
/// degrades to logged write failures, never delivery failures.
#[derive(Clone)]
pub struct CacheClient {
    backend: Backend,
    ttl_secs: u64,
}

impl CacheClient {
    /// Connect and verify the link with a PING. Startup fails fast on an
    /// unreachable cache; later outages only degrade to logged write
    /// failures.
    pub async fn connect(url: &str, ttl_secs: u64) -> Result<Self, RelayError> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;

        let cache = Self {
            backend: Backend::Redis(manager),
            ttl_secs,
        };
        cache.ping_checked().await?;
        Ok(cache)
    }

    /// A cache client with no backing store. Every operation fails with
    /// `CacheDisabled`; delivery correctness is unaffected.
    pub fn disconnected(ttl_secs: u64) -> Self {
        Self {
            backend: Backend::Disabled,
            ttl_secs,
        }
    }

    /// An in-process store with no cross-process visibility and no TTL
    /// expiry. Advisory records behave normally otherwise.
    pub fn in_memory(ttl_secs: u64) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(Mutex::new(HashMap::new()))),
            ttl_secs,
        }
    }

    /// Liveness probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        self.ping_checked().await.is_ok()
    }

    async fn ping_checked(&self) -> Result<(), RelayError> {
        match &self.backend {
            Backend::Disabled => Err(RelayError::CacheDisabled),
            Backend::Memory(_) => Ok(()),
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                if pong == "PONG" {
                    Ok(())
                } else {
                    Err(RelayError::Cache(redis::RedisError::from((
                        redis::ErrorKind::ResponseError,
                        "unexpected PING reply",
                    ))))
                }
            }
        }
    }

    /// Write or refresh a user's session record.
    pub async fn store_session(&self, record: &SessionRecord) -> Result<(), RelayError> {
        self.set_json(&session_key(&record.user_id), record).await
    }

    /// Drop a session record on clean disconnect. Optional for correctness
    /// (TTL expiry covers crashes) but shrinks the staleness window.
    pub async fn delete_session(&self, user_id: &str) -> Result<(), RelayError> {
        self.delete(&session_key(user_id)).await
    }

    /// Current session record for a user, if one is cached.
    pub async fn fetch_session(&self, user_id: &str) -> Result<Option<SessionRecord>, RelayError> {
        self.get_json(&session_key(user_id)).await
    }

    /// Write or refresh a room-state record.
    pub async fn store_room_state(&self, record: &RoomStateRecord) -> Result<(), RelayError> {
        self.set_json(&room_key(&record.duel_id), record).await
    }

    /// Drop a room record once its last participant leaves.
    pub async fn delete_room_state(&self, duel_id: &str) -> Result<(), RelayError> {
        self.delete(&room_key(duel_id)).await
    }

    /// Current room record, if one is cached.
    pub async fn fetch_room_state(
        &self,
        duel_id: &str,
    ) -> Result<Option<RoomStateRecord>, RelayError> {
        self.get_json(&room_key(duel_id)).await
    }

    async fn set_json<T: Serialize>(&self, key: &str, value: &T) -> Result<(), RelayError> {
        let json = serde_json::to_string(value)?;
        match &self.backend {
            Backend::Disabled => Err(RelayError::CacheDisabled),
            Backend::Memory(map) => {
                map.lock().unwrap().insert(key.to_string(), json);
                Ok(())
            }
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let _: () = redis::cmd("SET")
                    .arg(key)
                    .arg(json)
                    .arg("EX")
                    .arg(self.ttl_secs)
                    .query_async(&mut conn)
                    .await?;
                Ok(())
            }
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>, RelayError> {
        let json: Option<String> = match &self.backend {
            Backend::Disabled => return Err(RelayError::CacheDisabled),
            Backend::Memory(map) => map.lock().unwrap().get(key).cloned(),
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                redis::cmd("GET").arg(key).query_async(&mut conn).await?
            }
        };

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RelayError> {
        match &self.backend {
            Backend::Disabled => Err(RelayError::CacheDisabled),
            Backend::Memory(map) => {
                map.lock().unwrap().remove(key);
                Ok(())
            }
            Backend::Redis(manager) => {
                let mut conn = manager.clone();
                let _: () = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
                Ok(())
            }
        }
    }
}
