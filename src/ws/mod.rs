pub mod actor;
pub mod handler;
pub mod protocol;

pub use crate::registry::ConnectionSender;

/// Identity a connection runs under: the authenticated user, plus the duel
/// room for room-scoped connections.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub user_id: String,
    pub duel_id: Option<String>,
}

impl ConnectionContext {
    pub fn notification(user_id: String) -> Self {
        Self {
            user_id,
            duel_id: None,
        }
    }

    pub fn duel(user_id: String, duel_id: String) -> Self {
        Self {
            user_id,
            duel_id: Some(duel_id),
        }
    }
}
