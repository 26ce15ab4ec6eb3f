use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde_json::json;

use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// GET /healthz — consumed by external monitoring.
/// Reports live connection/room counts and the up/down state of both
/// infrastructure dependencies. Unhealthy (503) until both are up, so the
/// service is never silently degraded behind a green check.
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let broker_up = state.broker_health.is_up();
    let cache_up = state.cache.ping().await;

    let status = if broker_up && cache_up {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "connections": state.registry.connection_count(),
            "rooms": state.registry.room_count(),
            "broker_up": broker_up,
            "cache_up": cache_up,
        })),
    )
}

/// Build the axum Router: two WebSocket upgrade paths plus health.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/notifications", get(ws_handler::notifications_upgrade))
        .route("/ws/duels/{duel_id}", get(ws_handler::duel_upgrade))
        .route("/healthz", get(health))
        .with_state(state)
}
