//! Durable AMQP client on lapin.
//!
//! Reconnection is transparent to callers of `publish`, but NOT to topology:
//! after every reconnect the supervisor re-runs `ensure_topology` and
//! re-registers the consumer before resuming, since broker-side declarations
//! do not survive a dropped connection to a non-durable queue.

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

use super::{keys, BrokerHealth, EventPublisher, EVENTS_QUEUE, EXCHANGE};
use crate::error::RelayError;
use crate::router::Dispatcher;

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct BrokerConfig {
    url: String,
    queue_ttl_ms: u32,
}

/// Handle to the broker link. Cloning shares the underlying connection.
#[derive(Clone)]
pub struct BrokerClient {
    cfg: Arc<BrokerConfig>,
    channel: Arc<RwLock<Option<Channel>>>,
    connection: Arc<Mutex<Option<Connection>>>,
    health: BrokerHealth,
    closing: Arc<AtomicBool>,
}

impl BrokerClient {
    /// Establish the initial connection, with bounded retry, and declare
    /// topology. Fails fast if the broker stays unreachable — the process
    /// must not serve without it.
    pub async fn connect(
        url: &str,
        queue_ttl_ms: u32,
        connect_attempts: u32,
    ) -> Result<Self, RelayError> {
        let cfg = BrokerConfig {
            url: url.to_string(),
            queue_ttl_ms,
        };

        let mut backoff = RECONNECT_BACKOFF_START;
        let mut last_err: Option<lapin::Error> = None;

        for attempt in 1..=connect_attempts {
            match Connection::connect(&cfg.url, ConnectionProperties::default()).await {
                Ok(conn) => {
                    let channel = conn.create_channel().await?;
                    ensure_topology(&channel, cfg.queue_ttl_ms).await?;

                    tracing::info!(attempt, "Broker connected, topology declared");

                    let health = BrokerHealth::new();
                    health.set_up(true);

                    return Ok(Self {
                        cfg: Arc::new(cfg),
                        channel: Arc::new(RwLock::new(Some(channel))),
                        connection: Arc::new(Mutex::new(Some(conn))),
                        health,
                        closing: Arc::new(AtomicBool::new(false)),
                    });
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Broker connection failed");
                    last_err = Some(e);
                    if attempt < connect_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(RelayError::Broker(e)),
            None => Err(RelayError::BrokerUnavailable(connect_attempts)),
        }
    }

    /// Up/down flag for the health endpoint.
    pub fn health(&self) -> BrokerHealth {
        self.health.clone()
    }

    /// Spawn the consume supervisor: consumes `websocket-events` and feeds
    /// each delivery to the dispatcher, reconnecting (and re-declaring
    /// topology) whenever the link drops.
    ///
    /// Consumption is auto-acknowledged: at-most-once. Messages in flight
    /// during a crash are lost, and redelivery across reconnects can
    /// duplicate. Accepted trade-off for ephemeral fan-out traffic.
    pub fn spawn_consumer(&self, dispatcher: Arc<Dispatcher>) {
        let client = self.clone();

        tokio::spawn(async move {
            let mut backoff = RECONNECT_BACKOFF_START;

            loop {
                if client.closing.load(Ordering::Relaxed) {
                    return;
                }

                let channel = match client.live_channel().await {
                    Ok(channel) => {
                        backoff = RECONNECT_BACKOFF_START;
                        client.health.set_up(true);
                        channel
                    }
                    Err(e) => {
                        client.health.set_up(false);
                        tracing::warn!(error = %e, "Broker reconnect failed, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                        continue;
                    }
                };

                client.consume_until_closed(&channel, &dispatcher).await;

                client.health.set_up(false);
                *client.channel.write().await = None;

                if client.closing.load(Ordering::Relaxed) {
                    return;
                }
                tracing::warn!("Broker consumer stopped, reconnecting");
            }
        });
    }

    /// Stop the supervisor and close the connection, bounded by `timeout`.
    pub async fn close(&self, timeout: Duration) {
        self.closing.store(true, Ordering::Relaxed);
        self.health.set_up(false);
        *self.channel.write().await = None;

        if let Some(conn) = self.connection.lock().await.take() {
            match tokio::time::timeout(timeout, conn.close(200, "shutdown")).await {
                Ok(Ok(())) => tracing::info!("Broker connection closed"),
                Ok(Err(e)) => tracing::warn!(error = %e, "Broker close failed"),
                Err(_) => tracing::warn!("Broker close timed out"),
            }
        }
    }

    /// Return the current channel, reconnecting and re-declaring topology
    /// if the previous one is gone.
    async fn live_channel(&self) -> Result<Channel, RelayError> {
        if let Some(channel) = self.channel.read().await.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let conn = Connection::connect(&self.cfg.url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;
        ensure_topology(&channel, self.cfg.queue_ttl_ms).await?;

        tracing::info!("Broker reconnected, topology re-declared");

        *self.connection.lock().await = Some(conn);
        *self.channel.write().await = Some(channel.clone());
        Ok(channel)
    }

    /// Drive one consumer until its stream ends or errors.
    async fn consume_until_closed(&self, channel: &Channel, dispatcher: &Arc<Dispatcher>) {
        let mut consumer = match channel
            .basic_consume(
                EVENTS_QUEUE,
                "duel-relay",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to start consumer");
                return;
            }
        };

        tracing::info!(queue = EVENTS_QUEUE, "Consuming broker events");

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let routing_key = delivery.routing_key.as_str().to_string();
                    dispatcher.dispatch_broker(&routing_key, &delivery.data).await;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Consumer stream error");
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl EventPublisher for BrokerClient {
    /// Publish a JSON payload with persistent delivery mode.
    ///
    /// Failures surface to the caller and are never retried here.
    async fn publish(&self, routing_key: &str, payload: Value) -> Result<(), RelayError> {
        let body = serde_json::to_vec(&payload)?;

        let guard = self.channel.read().await;
        let channel = guard.as_ref().ok_or(RelayError::BrokerChannelClosed)?;

        channel
            .basic_publish(
                EXCHANGE,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await?;

        tracing::debug!(routing_key = %routing_key, bytes = body.len(), "Published broker event");
        Ok(())
    }
}

/// Idempotent topology declaration: topic exchange, TTL-bounded events
/// queue, and its bindings. Run at startup and after every reconnect.
async fn ensure_topology(channel: &Channel, queue_ttl_ms: u32) -> Result<(), RelayError> {
    channel
        .exchange_declare(
            EXCHANGE,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut queue_args = FieldTable::default();
    queue_args.insert("x-message-ttl".into(), AMQPValue::LongUInt(queue_ttl_ms));

    channel
        .queue_declare(
            EVENTS_QUEUE,
            QueueDeclareOptions {
                durable: false,
                ..Default::default()
            },
            queue_args,
        )
        .await?;

    for pattern in [keys::BIND_DUEL_WEBSOCKET, keys::BIND_NOTIFICATIONS] {
        channel
            .queue_bind(
                EVENTS_QUEUE,
                EXCHANGE,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
    }

    Ok(())
}
