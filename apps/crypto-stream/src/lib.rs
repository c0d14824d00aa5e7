#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::cast_possible_wrap
    )
)]

//! Crypto Stream - Trade Ingestion and Fan-out
//!
//! Maintains one upstream connection to the Binance trade stream for a
//! configured set of symbols, persists every trade in timed batches, and
//! fans each trade out live to WebSocket subscribers grouped by symbol.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core trade types and buffering
//!   - `trade`: Symbols and normalized trade records
//!   - `batch`: Per-symbol batch buffer with atomic drain
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: `TradeStore` persistence port
//!   - `services`: Batch flushing, subscriber sessions
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `binance`: Upstream client, normalizer, reconnect and heartbeat
//!   - `broadcast`: Per-symbol fan-out broker
//!   - `persistence`: In-process trade store
//!   - `websocket`: Subscriber WebSocket server
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//!                                  ┌──────────────┐  timer  ┌─────────────┐
//!                             ┌───►│ Batch Buffer │────────►│ Trade Store │
//! Binance WS ──► Normalizer ──┤    └──────────────┘         └─────────────┘
//!                             │    ┌──────────────┐
//!                             └───►│   Fan-out    │──► Subscriber 1
//!                                  │    Broker    │──► Subscriber N
//!                                  └──────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core trade types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::batch::{Batch, BatchBuffer, BufferLimit, OverflowPolicy};
pub use domain::trade::{NewTrade, Symbol, TradeRecord};

// Ports and services
pub use application::ports::{StoreError, TradeStore};
pub use application::services::{BatchFlusher, ServerMessage, SubscriptionSession};

// Infrastructure config
pub use infrastructure::config::{
    BroadcastSettings, BufferSettings, ConfigError, ServerSettings, StreamConfig,
    UpstreamSettings,
};

// Upstream client
pub use infrastructure::binance::{
    ConnectionState, FeedState, IngestionClient, IngestionClientConfig, IngestionError,
    IngestionHandle, TradeNormalizer,
};

// Broker and store
pub use infrastructure::broadcast::{BroadcastConfig, FanoutBroker};
pub use infrastructure::persistence::InMemoryTradeStore;

// Servers
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};
pub use infrastructure::websocket::{
    SubscriberServer, SubscriberServerError, SubscriberServerState,
};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
