use std::sync::Arc;

use crate::auth::Authorize;
use crate::broker::BrokerHealth;
use crate::cache::CacheClient;
use crate::registry::ConnectionRegistry;
use crate::router::Dispatcher;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Live connection and room maps (authoritative presence)
    pub registry: ConnectionRegistry,
    /// Message router shared by the consumer task and every connection actor
    pub dispatcher: Arc<Dispatcher>,
    /// Advisory session/room cache
    pub cache: CacheClient,
    /// External authorization collaborator
    pub authorizer: Arc<dyn Authorize>,
    /// Broker link up/down flag for the health endpoint
    pub broker_health: BrokerHealth,
}
