//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, upstream connection status, and Prometheus
//! metrics. Used by container orchestrators, load balancers, and monitoring
//! systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (upstream receiving)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::domain::batch::BatchBuffer;
use crate::domain::trade::Symbol;
use crate::infrastructure::binance::{ConnectionState, FeedState};
use crate::infrastructure::broadcast::FanoutBroker;
use crate::infrastructure::metrics::get_metrics_handle;

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
    /// Upstream feed status.
    pub upstream: UpstreamInfo,
    /// Live subscriber statistics.
    pub subscribers: SubscriberStatus,
    /// Records waiting for the next flush.
    pub buffered_records: usize,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Upstream receiving.
    Healthy,
    /// Upstream connecting or recovering.
    Degraded,
    /// Upstream down or shutting down.
    Unhealthy,
}

impl From<ConnectionState> for HealthStatus {
    fn from(state: ConnectionState) -> Self {
        match state {
            ConnectionState::Receiving => Self::Healthy,
            ConnectionState::Connecting
            | ConnectionState::Subscribed
            | ConnectionState::Reconnecting => Self::Degraded,
            ConnectionState::Disconnected | ConnectionState::Closing => Self::Unhealthy,
        }
    }
}

/// Upstream feed status.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamInfo {
    /// Connection state.
    pub state: ConnectionState,
    /// Symbols subscribed upstream.
    pub symbols: Vec<Symbol>,
    /// Frames received since start.
    pub messages_received: u64,
    /// Trades accepted since start.
    pub trades_received: u64,
    /// Current reconnect attempts (0 while receiving).
    pub reconnect_attempts: u32,
    /// When the feed last reached the receiving state.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last connection error.
    pub last_error: Option<String>,
}

/// Live subscriber statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStatus {
    /// Connected subscribers across all symbols.
    pub total: usize,
    /// Symbols with at least one subscriber.
    pub active_symbols: Vec<Symbol>,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    symbols: Vec<Symbol>,
    feed: Arc<FeedState>,
    broker: Arc<FanoutBroker>,
    buffer: Arc<BatchBuffer>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        symbols: Vec<Symbol>,
        feed: Arc<FeedState>,
        broker: Arc<FanoutBroker>,
        buffer: Arc<BatchBuffer>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            symbols,
            feed,
            broker,
            buffer,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Build the health router.
pub fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

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
    if state.feed.state() == ConnectionState::Receiving {
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
    let connection = state.feed.state();

    HealthResponse {
        status: HealthStatus::from(connection),
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        upstream: UpstreamInfo {
            state: connection,
            symbols: state.symbols.clone(),
            messages_received: state.feed.messages_received(),
            trades_received: state.feed.trades_received(),
            reconnect_attempts: state.feed.reconnect_attempts(),
            last_connected_at: state.feed.last_connected_at(),
            last_error: state.feed.last_error(),
        },
        subscribers: SubscriberStatus {
            total: state.broker.total_subscribers(),
            active_symbols: state.broker.active_symbols(),
        },
        buffered_records: state.buffer.len(),
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

    fn state() -> (Arc<HealthServerState>, Arc<FeedState>) {
        let feed = Arc::new(FeedState::new());
        let state = Arc::new(HealthServerState::new(
            "0.1.0".to_string(),
            vec![Symbol::new("btcusdt")],
            Arc::clone(&feed),
            Arc::new(FanoutBroker::with_defaults()),
            Arc::new(BatchBuffer::unbounded()),
        ));
        (state, feed)
    }

    async fn get_status(app: Router, uri: &str) -> StatusCode {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
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
    fn status_follows_connection_state() {
        assert_eq!(HealthStatus::from(ConnectionState::Receiving), HealthStatus::Healthy);
        assert_eq!(HealthStatus::from(ConnectionState::Subscribed), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(ConnectionState::Reconnecting), HealthStatus::Degraded);
        assert_eq!(HealthStatus::from(ConnectionState::Disconnected), HealthStatus::Unhealthy);
        assert_eq!(HealthStatus::from(ConnectionState::Closing), HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn liveness_always_ok() {
        let (state, _) = state();
        assert_eq!(get_status(router(state), "/healthz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_tracks_receiving_state() {
        let (state, feed) = state();
        assert_eq!(
            get_status(router(Arc::clone(&state)), "/readyz").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        feed.set_state(ConnectionState::Receiving);
        assert_eq!(get_status(router(state), "/readyz").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_unavailable_while_disconnected() {
        let (state, _) = state();
        assert_eq!(
            get_status(router(state), "/health").await,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn response_includes_upstream_and_subscribers() {
        let (state, feed) = state();
        feed.set_state(ConnectionState::Receiving);

        let response = build_health_response(&state);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["upstream"]["state"], "receiving");
        assert_eq!(json["upstream"]["symbols"][0], "btcusdt");
        assert_eq!(json["subscribers"]["total"], 0);
        assert_eq!(json["buffered_records"], 0);
    }
}
