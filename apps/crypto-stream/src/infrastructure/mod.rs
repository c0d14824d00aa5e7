//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer, plus the network edges of the service.

/// Binance trade stream client (normalizer, reconnect, heartbeat).
pub mod binance;

/// Per-symbol fan-out to live subscribers.
pub mod broadcast;

/// Configuration from environment variables.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Trade store implementations.
pub mod persistence;

/// OpenTelemetry tracing integration.
pub mod telemetry;

/// Subscriber WebSocket server.
pub mod websocket;
