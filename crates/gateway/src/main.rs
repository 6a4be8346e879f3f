//! Gateway service entry point.
//!
//! Multi-tenant WebSocket message bus with per-project room isolation.

use anyhow::{Context, Result};
use gateway::{create_router, AppState, Config, Rooms};
use keystore::KeyStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use storage::{MemoryStore, RedisStore, RoomStore};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting message bus gateway");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  DATABASE_URL: {}", config.database_url);
    info!("  REDIS_URL: {}", config.redis_url.as_deref().unwrap_or("<memory store>"));
    info!("  BYPASS_PROJECTS: {:?}", config.bypass_projects);
    info!("  REQUEST_TIMEOUT_MS: {}", config.request_timeout_ms);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
        .context("failed to start Prometheus exporter")?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Durable room store: Redis when configured, in-memory otherwise.
    let store: Arc<dyn RoomStore> = match &config.redis_url {
        Some(url) => {
            info!("Using Redis room store at {}", url);
            Arc::new(RedisStore::new(url).context("failed to open Redis client")?)
        }
        None => {
            info!("Using in-memory room store");
            Arc::new(MemoryStore::new())
        }
    };

    // API key store
    let keys = KeyStore::connect(&config.database_url)
        .await
        .context("failed to open key store")?;
    info!("Key store ready ({:?})", keys.driver());

    // Room registry
    let rooms = Rooms::new(store.clone(), config.room_settings());

    // Periodic sweep of exited room handles
    let sweeper = rooms.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(60));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            sweeper.sweep();
        }
    });

    let http_port = config.http_port;
    let state = Arc::new(AppState {
        rooms,
        store,
        keys,
        config,
    });
    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind listen socket")?;
    info!("Gateway listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
