//! End-to-end tests: real axum server, real WebSocket clients, stubbed
//! authorization collaborator and recording publisher. The cache is
//! disconnected throughout — presence caching is advisory and must never
//! affect delivery.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use duel_relay::auth::Authorize;
use duel_relay::broker::{BrokerHealth, EventPublisher};
use duel_relay::cache::CacheClient;
use duel_relay::error::RelayError;
use duel_relay::registry::ConnectionRegistry;
use duel_relay::router::Dispatcher;
use duel_relay::state::AppState;
use duel_relay::ws::ConnectionContext;

/// Tokens look like `tok-<user id>`; U3 is never authorized for any room.
struct StubAuthorizer;

#[async_trait]
impl Authorize for StubAuthorizer {
    async fn authenticate(&self, token: &str) -> Result<Option<String>, RelayError> {
        Ok(token.strip_prefix("tok-").map(|s| s.to_string()))
    }

    async fn authorize_room(&self, user_id: &str, _duel_id: &str) -> Result<bool, RelayError> {
        Ok(user_id != "U3")
    }
}

#[derive(Default)]
struct RecordingPublisher {
    events: Mutex<Vec<(String, Value)>>,
}

impl RecordingPublisher {
    fn recorded(&self) -> Vec<(String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, routing_key: &str, payload: Value) -> Result<(), RelayError> {
        self.events
            .lock()
            .unwrap()
            .push((routing_key.to_string(), payload));
        Ok(())
    }
}

struct TestServer {
    addr: SocketAddr,
    registry: ConnectionRegistry,
    dispatcher: Arc<Dispatcher>,
    publisher: Arc<RecordingPublisher>,
    broker_health: BrokerHealth,
}

/// Start the relay on a random port with stub collaborators.
async fn start_test_server() -> TestServer {
    let registry = ConnectionRegistry::new();
    let publisher = Arc::new(RecordingPublisher::default());
    let cache = CacheClient::disconnected(60);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        publisher.clone() as Arc<dyn EventPublisher>,
        cache.clone(),
    ));
    let broker_health = BrokerHealth::new();

    let state = AppState {
        registry: registry.clone(),
        dispatcher: dispatcher.clone(),
        cache,
        authorizer: Arc::new(StubAuthorizer),
        broker_health: broker_health.clone(),
    };

    let app = duel_relay::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        registry,
        dispatcher,
        publisher,
        broker_health,
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(addr: SocketAddr, path: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}{path}"))
        .await
        .expect("WebSocket connect failed");
    stream
}

/// Next JSON text frame, skipping transport ping/pong. None on timeout.
async fn next_json(stream: &mut WsStream) -> Option<Value> {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                return serde_json::from_str(&text).ok();
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
            _ => return None,
        }
    }
}

/// Poll until `cond` holds or ~2s elapse.
async fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn welcome_frame_on_connect() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "/ws/notifications?token=tok-U1").await;

    let welcome = next_json(&mut ws).await.expect("expected welcome frame");
    assert_eq!(welcome["type"], "welcome");
    assert_eq!(welcome["data"]["userId"], "U1");
    assert_eq!(welcome["data"]["channel"], "notification");
}

#[tokio::test]
async fn notification_reaches_both_tabs_and_survives_one_close() {
    let server = start_test_server().await;
    let mut tab1 = connect(server.addr, "/ws/notifications?token=tok-U1").await;
    let mut tab2 = connect(server.addr, "/ws/notifications?token=tok-U1").await;
    next_json(&mut tab1).await.expect("welcome");
    next_json(&mut tab2).await.expect("welcome");

    server
        .dispatcher
        .dispatch_broker(
            "activity.user.notification",
            br#"{"userId": "U1", "data": {"n": 1}}"#,
        )
        .await;

    let expected = json!({"type": "notification", "data": {"n": 1}});
    assert_eq!(next_json(&mut tab1).await, Some(expected.clone()));
    assert_eq!(next_json(&mut tab2).await, Some(expected));

    // Close tab1; tab2 keeps receiving
    tab1.close(None).await.unwrap();
    let registry = server.registry.clone();
    assert!(wait_for(move || registry.connection_count() == 1).await);

    server
        .dispatcher
        .dispatch_broker(
            "activity.user.notification",
            br#"{"userId": "U1", "data": {"n": 2}}"#,
        )
        .await;
    assert_eq!(
        next_json(&mut tab2).await,
        Some(json!({"type": "notification", "data": {"n": 2}}))
    );
}

#[tokio::test]
async fn duel_room_fanout_and_disconnect_event() {
    let server = start_test_server().await;
    let mut p1 = connect(server.addr, "/ws/duels/D1?token=tok-U1").await;
    let mut p2 = connect(server.addr, "/ws/duels/D1?token=tok-U2").await;
    next_json(&mut p1).await.expect("welcome");
    next_json(&mut p2).await.expect("welcome");

    // Both admissions announced on the broker
    let publisher = server.publisher.clone();
    assert!(
        wait_for(move || {
            publisher
                .recorded()
                .iter()
                .filter(|(key, _)| key == "duel.player.connected")
                .count()
                == 2
        })
        .await
    );

    server
        .dispatcher
        .dispatch_broker(
            "duel.websocket.question",
            br#"{"duelId": "D1", "data": {"text": "Q1"}}"#,
        )
        .await;
    let expected = json!({"type": "question", "data": {"text": "Q1"}});
    assert_eq!(next_json(&mut p1).await, Some(expected.clone()));
    assert_eq!(next_json(&mut p2).await, Some(expected));

    // U2 leaves: disconnected event published, room shrinks to U1
    p2.close(None).await.unwrap();
    let publisher = server.publisher.clone();
    assert!(
        wait_for(move || {
            publisher.recorded().contains(&(
                "duel.player.disconnected".to_string(),
                json!({"duelId": "D1", "userId": "U2"}),
            ))
        })
        .await
    );
    assert_eq!(server.registry.room_participants("D1"), vec!["U1".to_string()]);

    // Subsequent status event reaches only U1
    server
        .dispatcher
        .dispatch_broker(
            "duel.websocket.status",
            br#"{"duelId": "D1", "data": {"scores": [1, 0]}}"#,
        )
        .await;
    assert_eq!(
        next_json(&mut p1).await,
        Some(json!({"type": "status", "data": {"scores": [1, 0]}}))
    );
}

#[tokio::test]
async fn answer_roundtrip_and_local_pong() {
    let server = start_test_server().await;
    let mut p1 = connect(server.addr, "/ws/duels/D1?token=tok-U1").await;
    next_json(&mut p1).await.expect("welcome");

    p1.send(Message::Text(
        r#"{"type": "answer", "data": {"questionId": 4, "choice": "a"}}"#.into(),
    ))
    .await
    .unwrap();

    let publisher = server.publisher.clone();
    assert!(
        wait_for(move || {
            publisher.recorded().contains(&(
                "duel.player.answered".to_string(),
                json!({"duelId": "D1", "userId": "U1", "answer": {"questionId": 4, "choice": "a"}}),
            ))
        })
        .await
    );

    p1.send(Message::Text(r#"{"type": "ping"}"#.into()))
        .await
        .unwrap();
    assert_eq!(next_json(&mut p1).await, Some(json!({"type": "pong"})));
}

#[tokio::test]
async fn refused_room_closes_with_4002_and_registers_nothing() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "/ws/duels/D1?token=tok-U3").await;

    match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => {
            assert_eq!(u16::from(frame.code), 4002);
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(server.registry.room_count(), 0);
    assert!(server.publisher.recorded().is_empty());
}

#[tokio::test]
async fn invalid_token_closes_with_4001() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "/ws/notifications?token=garbage").await;

    match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
        Ok(Some(Ok(Message::Close(Some(frame))))) => {
            assert_eq!(u16::from(frame.code), 4001);
        }
        other => panic!("expected close frame, got {other:?}"),
    }

    assert_eq!(server.registry.connection_count(), 0);
}

#[tokio::test]
async fn pong_timeout_tears_down_half_open_connection() {
    let registry = ConnectionRegistry::new();
    let publisher = Arc::new(RecordingPublisher::default());
    let cache = CacheClient::disconnected(60);
    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        publisher.clone() as Arc<dyn EventPublisher>,
        cache.clone(),
    ));
    let state = AppState {
        registry: registry.clone(),
        dispatcher,
        cache,
        authorizer: Arc::new(StubAuthorizer),
        broker_health: BrokerHealth::new(),
    };

    // Pre-authorized upgrade with fast keepalive timing, so the teardown
    // path is observable within the test window.
    let app = axum::Router::new()
        .route(
            "/ws/fast",
            axum::routing::get(
                |ws: axum::extract::ws::WebSocketUpgrade,
                 axum::extract::State(state): axum::extract::State<AppState>| async move {
                    ws.on_upgrade(move |socket| {
                        duel_relay::ws::actor::run_connection_with_keepalive(
                            socket,
                            state,
                            ConnectionContext::duel("U1".to_string(), "D1".to_string()),
                            Duration::from_millis(50),
                            Duration::from_millis(100),
                        )
                    })
                },
            ),
        )
        .with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // A client that completes the handshake and then goes silent: it never
    // polls its stream, so transport pings are never answered. The socket
    // stays open the whole time.
    let silent = connect(addr, "/ws/fast").await;

    let registry_view = registry.clone();
    assert!(wait_for(move || registry_view.room_count() == 1).await);

    // Missed pong must tear the actor down promptly: departure announced
    // and the room emptied, with the peer still holding its socket.
    let publisher_view = publisher.clone();
    assert!(
        wait_for(move || {
            publisher_view.recorded().contains(&(
                "duel.player.disconnected".to_string(),
                json!({"duelId": "D1", "userId": "U1"}),
            ))
        })
        .await
    );
    let registry_view = registry.clone();
    assert!(wait_for(move || registry_view.room_count() == 0).await);

    drop(silent);
}

#[tokio::test]
async fn health_reports_counts_and_dependency_state() {
    let server = start_test_server().await;
    let mut ws = connect(server.addr, "/ws/notifications?token=tok-U1").await;
    next_json(&mut ws).await.expect("welcome");

    let url = format!("http://{}/healthz", server.addr);

    // Broker down, cache disconnected: unhealthy
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["connections"], 1);
    assert_eq!(body["rooms"], 0);
    assert_eq!(body["broker_up"], false);
    assert_eq!(body["cache_up"], false);

    // Broker link recovering flips the flag, but cache stays down
    server.broker_health.set_up(true);
    let resp = reqwest::get(&url).await.unwrap();
    assert_eq!(resp.status(), 503);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["broker_up"], true);
    assert_eq!(body["cache_up"], false);
}
