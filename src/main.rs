mod auth;
mod broker;
mod cache;
mod config;
mod error;
mod registry;
mod router;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

use auth::HttpAuthorizer;
use broker::BrokerClient;
use cache::CacheClient;
use config::{generate_config_template, Config};
use registry::ConnectionRegistry;
use router::Dispatcher;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load config with layered precedence: defaults < TOML < env < CLI
    let config = Config::load()?;

    // Handle --generate-config: print template and exit
    if config.generate_config {
        print!("{}", generate_config_template());
        return Ok(());
    }

    // Initialize tracing/logging
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "duel_relay=info".parse().unwrap()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "duel_relay=info".parse().unwrap()),
            )
            .init();
    }

    tracing::info!("duel-relay v{} starting", env!("CARGO_PKG_VERSION"));

    // Startup order is fail-fast: broker first, then cache. If either
    // dependency is unavailable the process refuses to serve rather than
    // run silently broken.
    let broker = BrokerClient::connect(
        &config.amqp_url,
        config.queue_ttl_ms,
        config.connect_attempts,
    )
    .await?;

    let cache = CacheClient::connect(&config.redis_url, config.cache_ttl_secs).await?;
    tracing::info!("Cache connected");

    let registry = ConnectionRegistry::new();
    let authorizer = Arc::new(HttpAuthorizer::new(config.auth_url.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        registry.clone(),
        Arc::new(broker.clone()),
        cache.clone(),
    ));

    // Consume broker events only once topology is declared (connect did it)
    broker.spawn_consumer(dispatcher.clone());

    let app_state = state::AppState {
        registry,
        dispatcher,
        cache,
        authorizer,
        broker_health: broker.health(),
    };

    let app = routes::build_router(app_state);

    // Bind and serve; only now do we start accepting connections
    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Shutdown order: listener is already closed, then broker, then cache,
    // each bounded.
    tracing::info!("Shutting down");
    broker
        .close(Duration::from_secs(config.shutdown_timeout_secs))
        .await;
    // CacheClient's ConnectionManager closes when the last clone drops.

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining");
}
