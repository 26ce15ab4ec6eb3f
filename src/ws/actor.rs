use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};

use crate::state::AppState;
use crate::ws::protocol::ServerMessage;
use crate::ws::ConnectionContext;

/// Ping interval: server sends WebSocket ping every 30 seconds.
/// Prevents connection leaks from abrupt disconnects the peer never closes.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Pong timeout: if pong not received within 10 seconds after ping, close.
const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Run the actor-per-connection pattern for an admitted WebSocket.
///
/// Splits the socket into reader and writer halves:
/// - Writer task: owns the sink, forwards frames from an mpsc channel
/// - Reader task: feeds incoming frames to the dispatcher
///
/// The mpsc sender is what the registry holds; any task can clone it to
/// push frames to this client, and frames reach the sink in send order.
///
/// Cleanup runs on every exit path — close frame, read error, stream end,
/// pong timeout — so the registry never keeps a dead connection.
pub async fn run_connection(socket: WebSocket, state: AppState, ctx: ConnectionContext) {
    run_connection_with_keepalive(socket, state, ctx, PING_INTERVAL, PONG_TIMEOUT).await
}

/// `run_connection` with explicit keepalive timing.
///
/// A half-open peer never answers the close handshake, so the pong-timeout
/// path must not wait for the transport: the ping task signals `shutdown`
/// and the reader loop exits on it directly, reaching cleanup immediately.
pub async fn run_connection_with_keepalive(
    socket: WebSocket,
    state: AppState,
    ctx: ConnectionContext,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let (ws_sender, mut ws_receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel::<Message>();

    // Admission: the handler already authorized this identity.
    match ctx.duel_id.as_deref() {
        Some(duel_id) => state.registry.register_room(duel_id, &ctx.user_id, tx.clone()),
        None => state.registry.register_notification(&ctx.user_id, tx.clone()),
    }

    // Advisory cache records + player.connected for room connections.
    state.dispatcher.connection_opened(&ctx).await;

    let welcome = ServerMessage::Welcome {
        data: json!({
            "userId": ctx.user_id,
            "channel": if ctx.duel_id.is_some() { "duel" } else { "notification" },
            "duelId": ctx.duel_id,
        }),
    };
    if let Some(frame) = welcome.to_frame() {
        let _ = tx.send(frame);
    }

    tracing::info!(
        user_id = %ctx.user_id,
        duel_id = ?ctx.duel_id,
        "WebSocket actor started"
    );

    // Spawn writer task: forwards mpsc frames to the WebSocket sink
    let writer_handle = tokio::spawn(writer_task(ws_sender, rx));

    // Track pong reception
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel::<()>();

    // Teardown signal from the ping task to the reader loop
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Spawn ping task: sends periodic pings and monitors pong responses
    let ping_tx = tx.clone();
    let ping_handle = tokio::spawn(async move {
        let mut ping_timer = interval(ping_interval);
        // Skip the first immediate tick
        ping_timer.tick().await;

        loop {
            ping_timer.tick().await;

            if ping_tx.send(Message::Ping(vec![1, 2, 3, 4].into())).is_err() {
                // Writer task has died — connection is gone
                break;
            }

            match timeout(pong_timeout, pong_rx.recv()).await {
                Ok(Some(())) => {
                    // Pong received, continue
                }
                _ => {
                    tracing::warn!("Pong timeout, closing connection");
                    let _ = ping_tx.send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "Pong timeout".into(),
                    })));
                    break;
                }
            }
        }

        // Wake the reader; a half-open peer will never acknowledge the
        // close frame, and cleanup must not wait on the transport.
        let _ = shutdown_tx.send(true);
    });

    // Reader loop: feed incoming frames to the dispatcher
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                tracing::info!(user_id = %ctx.user_id, "Keepalive teardown, reader cancelled");
                break;
            }
            incoming = ws_receiver.next() => match incoming {
                Some(Ok(msg)) => match msg {
                    Message::Text(text) => {
                        state.dispatcher.dispatch_client(&ctx, text.as_str(), &tx).await;
                    }
                    Message::Binary(_) => {
                        tracing::debug!(user_id = %ctx.user_id, "Binary frame dropped, protocol is JSON text");
                    }
                    Message::Pong(_) => {
                        let _ = pong_tx.send(());
                    }
                    Message::Ping(data) => {
                        let _ = tx.send(Message::Pong(data));
                    }
                    Message::Close(frame) => {
                        tracing::info!(
                            user_id = %ctx.user_id,
                            reason = ?frame,
                            "Client initiated close"
                        );
                        break;
                    }
                },
                Some(Err(e)) => {
                    tracing::warn!(
                        user_id = %ctx.user_id,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
                None => {
                    // Stream ended — client disconnected
                    tracing::info!(user_id = %ctx.user_id, "WebSocket stream ended");
                    break;
                }
            }
        }
    }

    // Cleanup: abort writer and ping tasks
    writer_handle.abort();
    ping_handle.abort();

    // Remove this connection from the registry. A concurrent fan-out racing
    // this removal only ever hits the mpsc sender, which fails gracefully.
    match ctx.duel_id.as_deref() {
        Some(duel_id) => state.registry.unregister_room(duel_id, &ctx.user_id, &tx),
        None => state.registry.unregister_notification(&ctx.user_id, &tx),
    }

    // Cache cleanup + player.disconnected for room connections.
    state.dispatcher.connection_closed(&ctx).await;

    tracing::info!(
        user_id = %ctx.user_id,
        duel_id = ?ctx.duel_id,
        "WebSocket actor stopped"
    );
}

/// Writer task: receives frames from the mpsc channel and forwards them to
/// the WebSocket sink.
async fn writer_task(
    mut ws_sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            // WebSocket send failed — connection is broken
            break;
        }
    }
}
