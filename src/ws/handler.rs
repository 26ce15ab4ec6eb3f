use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use serde::Deserialize;

use crate::state::AppState;
use crate::ws::{actor, ConnectionContext};

/// Query parameters for WebSocket connection. Auth is via ?token= since
/// browser WebSocket clients cannot set headers.
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: String,
}

/// WebSocket close codes:
/// 4001 = token invalid or auth service unreachable
/// 4002 = not authorized for the requested duel room
pub const CLOSE_UNAUTHENTICATED: u16 = 4001;
pub const CLOSE_ROOM_REFUSED: u16 = 4002;

/// GET /ws/notifications?token=...
/// Per-user notification channel. On auth failure, upgrades then
/// immediately closes with the distinguishing close code.
pub async fn notifications_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    match authenticate(&state, &params.token).await {
        Some(user_id) => {
            tracing::info!(user_id = %user_id, "Notification connection authenticated");
            ws.on_upgrade(move |socket| {
                actor::run_connection(socket, state, ConnectionContext::notification(user_id))
            })
        }
        None => refuse(ws, CLOSE_UNAUTHENTICATED, "Token invalid"),
    }
}

/// GET /ws/duels/{duel_id}?token=...
/// Duel room channel. Requires both a valid token and room authorization
/// from the external collaborator; refusal closes with 4002 and leaves the
/// room map untouched.
pub async fn duel_upgrade(
    State(state): State<AppState>,
    Path(duel_id): Path<String>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = authenticate(&state, &params.token).await else {
        return refuse(ws, CLOSE_UNAUTHENTICATED, "Token invalid");
    };

    let authorized = match state.authorizer.authorize_room(&user_id, &duel_id).await {
        Ok(authorized) => authorized,
        Err(e) => {
            tracing::error!(user_id = %user_id, duel_id = %duel_id, error = %e, "Room authorization check failed");
            false
        }
    };

    if !authorized {
        tracing::warn!(user_id = %user_id, duel_id = %duel_id, "Room authorization refused");
        return refuse(ws, CLOSE_ROOM_REFUSED, "Not authorized for this duel");
    }

    tracing::info!(user_id = %user_id, duel_id = %duel_id, "Duel connection authorized");
    ws.on_upgrade(move |socket| {
        actor::run_connection(socket, state, ConnectionContext::duel(user_id, duel_id))
    })
}

async fn authenticate(state: &AppState, token: &str) -> Option<String> {
    match state.authorizer.authenticate(token).await {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::error!(error = %e, "Token validation call failed");
            None
        }
    }
}

/// Upgrade the connection, then immediately close it with the given code.
/// Nothing is registered for refused connections.
fn refuse(ws: WebSocketUpgrade, code: u16, reason: &'static str) -> Response {
    tracing::warn!(close_code = code, reason, "WebSocket admission refused");

    ws.on_upgrade(move |mut socket: WebSocket| async move {
        let close_frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        let _ = socket.send(Message::Close(Some(close_frame))).await;
    })
}
