//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, sync status reporting, and Prometheus metrics.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness check (simple OK)
//! - `GET /readyz` - Kubernetes readiness check (checks the peer transport)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::SyncEngine;
use crate::domain::connection::ConnectionState;
use crate::domain::mutation::QueueStats;
use crate::domain::subscription::RegistryStats;
use crate::infrastructure::metrics::get_metrics_handle;
use crate::infrastructure::monitor::MetricsSnapshot;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Service version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Peer transport status.
    pub transport: TransportStatus,
    /// Offline queue depth.
    pub queue: QueueStats,
    /// Subscription statistics.
    pub subscriptions: RegistryStats,
    /// Topics with a running upstream feed.
    pub active_feeds: Vec<String>,
    /// Metrics since the last monitor sample.
    pub metrics: MetricsSnapshot,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// All systems operational.
    Healthy,
    /// Some systems degraded but functional.
    Degraded,
    /// Critical systems unavailable.
    Unhealthy,
}

/// Peer transport status.
#[derive(Debug, Clone, Serialize)]
pub struct TransportStatus {
    /// Whether a transport is configured at all.
    pub configured: bool,
    /// Connection state.
    pub state: ConnectionState,
    /// Whether the transport is connected.
    pub connected: bool,
    /// Frames written to the peer.
    pub frames_sent: u64,
    /// Frames read from the peer.
    pub frames_received: u64,
    /// Outbound frames dropped on overflow.
    pub frames_dropped: u64,
    /// Reconnection attempts.
    pub reconnects: u64,
    /// Frames waiting to be flushed.
    pub pending: usize,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    engine: Arc<SyncEngine>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(version: String, engine: Arc<SyncEngine>) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            engine,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

/// Routes served by the health server.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let engine = &state.engine;
    let is_ready =
        !engine.has_transport() || engine.connection_state() == ConnectionState::Connected;

    if is_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let engine = &state.engine;
    let transport = transport_status(engine);
    let queue = engine.queue_stats();

    HealthResponse {
        status: determine_health_status(&transport, queue),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        transport,
        queue,
        subscriptions: engine.registry_stats(),
        active_feeds: engine.active_feeds(),
        metrics: engine.metrics(),
    }
}

fn transport_status(engine: &SyncEngine) -> TransportStatus {
    engine.connection().map_or(
        TransportStatus {
            configured: false,
            state: ConnectionState::Disconnected,
            connected: false,
            frames_sent: 0,
            frames_received: 0,
            frames_dropped: 0,
            reconnects: 0,
            pending: 0,
        },
        |connection| {
            let stats = connection.stats();
            TransportStatus {
                configured: true,
                state: stats.state,
                connected: stats.state == ConnectionState::Connected,
                frames_sent: stats.frames_sent,
                frames_received: stats.frames_received,
                frames_dropped: stats.frames_dropped,
                reconnects: stats.reconnects,
                pending: stats.pending,
            }
        },
    )
}

fn determine_health_status(transport: &TransportStatus, queue: QueueStats) -> HealthStatus {
    if !transport.configured {
        return if queue.failed > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
    }

    match transport.state {
        ConnectionState::Connected if queue.failed == 0 => HealthStatus::Healthy,
        ConnectionState::Connected | ConnectionState::Connecting | ConnectionState::Reconnecting => {
            HealthStatus::Degraded
        }
        ConnectionState::Disconnected => HealthStatus::Unhealthy,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::application::ports::{MockRemoteWriter, WriteOutcome};

    fn transport(state: ConnectionState) -> TransportStatus {
        TransportStatus {
            configured: true,
            state,
            connected: state == ConnectionState::Connected,
            frames_sent: 0,
            frames_received: 0,
            frames_dropped: 0,
            reconnects: 0,
            pending: 0,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn determine_status_connected() {
        let status =
            determine_health_status(&transport(ConnectionState::Connected), QueueStats::default());
        assert_eq!(status, HealthStatus::Healthy);
    }

    #[test]
    fn determine_status_failed_mutations() {
        let queue = QueueStats {
            failed: 2,
            ..QueueStats::default()
        };
        let status = determine_health_status(&transport(ConnectionState::Connected), queue);
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_reconnecting() {
        let status = determine_health_status(
            &transport(ConnectionState::Reconnecting),
            QueueStats::default(),
        );
        assert_eq!(status, HealthStatus::Degraded);
    }

    #[test]
    fn determine_status_disconnected() {
        let status = determine_health_status(
            &transport(ConnectionState::Disconnected),
            QueueStats::default(),
        );
        assert_eq!(status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn health_endpoint_without_transport() {
        let mut writer = MockRemoteWriter::new();
        writer.expect_write().returning(|_| Ok(WriteOutcome::Applied));
        let engine = SyncEngine::builder()
            .remote_writer(Arc::new(writer))
            .build()
            .await
            .unwrap();
        let app = router(Arc::new(HealthServerState::new(
            "test".to_string(),
            Arc::clone(&engine),
        )));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app
            .oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        engine.shutdown().await;
    }
}
