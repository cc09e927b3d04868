//! Market Sync Binary
//!
//! Starts the sync core against a remote peer.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-sync
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `SYNC_PEER_URL`: WebSocket URL of the remote peer
//!
//! ## Optional
//! - `SYNC_UPSTREAM_URL`: HTTP market data API polled for subscribed topics
//! - `SYNC_TOPICS`: Comma-separated topics the console peer subscribes to
//! - `SYNC_STORAGE_DIR`: Offline queue directory (default: data/mutations)
//! - `SYNC_DEFAULT_STRATEGY`: Default conflict strategy (default: server_wins)
//! - `SYNC_CONFLICT_STRATEGIES`: Per-type strategies, e.g. `bar:merge,note:manual`
//! - `SYNC_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4317>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_sync::application::ports::{DurableStore, UpstreamProvider};
use market_sync::domain::event::{
    CONNECTION_STATE_TOPIC, Event, MONITOR_ALERT_TOPIC, STREAM_ERROR_TOPIC, SYNC_CONFLICT_TOPIC,
    SYNC_ERROR_TOPIC,
};
use market_sync::infrastructure::bus::handler_fn;
use market_sync::infrastructure::health::{HealthServer, HealthServerState};
use market_sync::infrastructure::offline::FileStore;
use market_sync::infrastructure::streaming::HttpUpstreamProvider;
use market_sync::infrastructure::telemetry;
use market_sync::infrastructure::transport::WebSocketDialer;
use market_sync::{SyncConfig, SyncEngine, init_metrics};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Peer id of the local console subscriber.
const CONSOLE_PEER: &str = "console";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Market Sync");

    // Initialize Prometheus metrics
    let _metrics_handle = init_metrics();

    let config = SyncConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let dialer = Arc::new(WebSocketDialer::new(config.require_peer_url()?));
    let store: Arc<dyn DurableStore> = Arc::new(
        FileStore::open(&config.queue.storage_dir)
            .await
            .with_context(|| format!("cannot open {}", config.queue.storage_dir.display()))?,
    );

    let mut builder = SyncEngine::builder()
        .config(&config)
        .dialer(dialer)
        .store(store)
        .cancel_token(shutdown_token.child_token());
    if let Some(url) = &config.streaming.upstream_url {
        let provider: Arc<dyn UpstreamProvider> = Arc::new(HttpUpstreamProvider::new(
            url.clone(),
            config.streaming.fetch_timeout,
        )?);
        builder = builder.upstream(provider);
    }
    let engine = builder.build().await.context("failed to start sync engine")?;

    // Log lifecycle and sync notifications
    engine.on_event(
        "console-notifications",
        [
            CONNECTION_STATE_TOPIC,
            SYNC_ERROR_TOPIC,
            SYNC_CONFLICT_TOPIC,
            STREAM_ERROR_TOPIC,
            MONITOR_ALERT_TOPIC,
        ],
        handler_fn(|event: Event| async move {
            tracing::info!(topic = %event.topic, payload = %event.payload, "Notification");
            Ok(())
        }),
    );

    // Console peer receives routed updates for the configured topics
    if !config.topics.is_empty() {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        engine.attach_peer(CONSOLE_PEER, Arc::new(tx));
        engine.subscribe(CONSOLE_PEER, config.topics.iter().cloned());
        tokio::spawn(log_updates(rx));
    }

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&engine),
    ));
    let health_server = HealthServer::new(
        config.server.health_port,
        health_state,
        shutdown_token.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    if let Err(e) = engine.connect().await {
        tracing::error!(error = %e, "Initial connection failed, mutations stay queued");
    }

    tracing::info!("Market sync ready");

    await_shutdown(shutdown_token).await;

    if tokio::time::timeout(SHUTDOWN_TIMEOUT, engine.shutdown())
        .await
        .is_err()
    {
        tracing::warn!("Shutdown timed out");
    }

    tracing::info!("Market sync stopped");
    Ok(())
}

/// Log updates routed to the console peer.
async fn log_updates(mut rx: mpsc::UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(
            topic = %event.topic,
            source = %event.source,
            payload = %event.payload,
            "Update"
        );
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_err() {
        load_dotenv_from_ancestors();
    }
}

/// Log the parsed configuration.
fn log_config(config: &SyncConfig) {
    tracing::info!(
        peer_url = config.transport.peer_url.as_deref().unwrap_or("<unset>"),
        upstream = config.streaming.upstream_url.is_some(),
        wire_format = ?config.transport.wire_format,
        health_port = config.server.health_port,
        topics = config.topics.len(),
        "Configuration loaded"
    );
    tracing::debug!(
        storage_dir = %config.queue.storage_dir.display(),
        default_strategy = %config.queue.conflict_policy.default_strategy(),
        max_retries = config.queue.max_retries,
        thresholds = config.monitor.thresholds.len(),
        "Sync settings"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv_from_ancestors() {
    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
}
