//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingestion**: upstream messages received, normalized and rejected
//! - **Persistence**: records flushed, records dropped, flush duration
//! - **Fan-out**: deliveries sent and dropped, evictions, active subscribers
//! - **Connection**: reconnect attempts
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Calling this again after a successful install returns the existing handle.
///
/// # Errors
///
/// Returns error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingestion
    describe_counter!(
        "crypto_stream_messages_received_total",
        "Total messages received from the upstream feed"
    );
    describe_counter!(
        "crypto_stream_trades_normalized_total",
        "Total trade events normalized"
    );
    describe_counter!(
        "crypto_stream_messages_rejected_total",
        "Total upstream messages dropped by the normalizer, by reason"
    );

    // Persistence
    describe_counter!(
        "crypto_stream_records_flushed_total",
        "Total trade records persisted"
    );
    describe_counter!(
        "crypto_stream_records_dropped_total",
        "Total trade records dropped before persistence, by reason"
    );
    describe_gauge!(
        "crypto_stream_buffered_records",
        "Trade records waiting in the batch buffer"
    );
    describe_histogram!(
        "crypto_stream_flush_duration_seconds",
        "Time to persist one drained batch"
    );

    // Fan-out
    describe_counter!(
        "crypto_stream_deliveries_total",
        "Trade records queued to live subscribers"
    );
    describe_counter!(
        "crypto_stream_deliveries_dropped_total",
        "Trade records not delivered to a subscriber"
    );
    describe_counter!(
        "crypto_stream_subscribers_evicted_total",
        "Subscribers torn down for falling behind"
    );
    describe_gauge!(
        "crypto_stream_active_subscribers",
        "Live subscriber channels across all symbols"
    );

    // Connection
    describe_counter!(
        "crypto_stream_reconnects_total",
        "Total upstream reconnection attempts"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why an upstream message was not turned into a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Not parseable.
    Malformed,
    /// Trade with missing or bad fields.
    InvalidFields,
    /// Not a trade event.
    Ignored,
}

impl RejectReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Malformed => "malformed",
            Self::InvalidFields => "invalid_fields",
            Self::Ignored => "ignored",
        }
    }
}

/// Why a buffered record never reached the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Symbol was not registered at flush time.
    UnknownSymbol,
    /// The store failed the whole batch.
    StoreError,
    /// The buffer limit was reached.
    BufferOverflow,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::UnknownSymbol => "unknown_symbol",
            Self::StoreError => "store_error",
            Self::BufferOverflow => "buffer_overflow",
        }
    }
}

/// Record a message received from the upstream feed.
pub fn record_message_received() {
    counter!("crypto_stream_messages_received_total").increment(1);
}

/// Record a trade normalized.
pub fn record_trade_normalized() {
    counter!("crypto_stream_trades_normalized_total").increment(1);
}

/// Record a message dropped by the normalizer.
pub fn record_message_rejected(reason: RejectReason) {
    counter!(
        "crypto_stream_messages_rejected_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record records persisted by a flush.
pub fn record_records_flushed(count: u64) {
    counter!("crypto_stream_records_flushed_total").increment(count);
}

/// Record records dropped before persistence.
pub fn record_records_dropped(reason: DropReason, count: u64) {
    counter!(
        "crypto_stream_records_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(count);
}

/// Update the buffered record gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_buffered_records(count: usize) {
    gauge!("crypto_stream_buffered_records").set(count as f64);
}

/// Record flush duration.
pub fn record_flush_duration(duration: Duration) {
    histogram!("crypto_stream_flush_duration_seconds").record(duration.as_secs_f64());
}

/// Record the outcome of one publish.
pub fn record_deliveries(delivered: u64, dropped: u64) {
    if delivered > 0 {
        counter!("crypto_stream_deliveries_total").increment(delivered);
    }
    if dropped > 0 {
        counter!("crypto_stream_deliveries_dropped_total").increment(dropped);
    }
}

/// Record subscribers evicted for falling behind.
pub fn record_subscribers_evicted(count: u64) {
    counter!("crypto_stream_subscribers_evicted_total").increment(count);
}

/// Update the active subscriber gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscribers(count: usize) {
    gauge!("crypto_stream_active_subscribers").set(count as f64);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("crypto_stream_reconnects_total").increment(1);
}

// =============================================================================
// Tests
// =============================================================================
