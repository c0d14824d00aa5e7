//! Batch Flush Scheduling
//!
//! Moves the batch buffer into the trade store on a fixed interval. The
//! timer runs independently of message arrival, so a quiet feed still
//! flushes; an empty drain is a no-op and never touches the store.
//!
//! An early flush can be requested (for example when the buffer reaches its
//! limit) through [`BatchFlusher::request_flush`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{FlushReport, TradeStore};
use crate::domain::batch::BatchBuffer;
use crate::infrastructure::metrics::{self, DropReason};

/// Default interval between flushes.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically drains a [`BatchBuffer`] into a [`TradeStore`].
pub struct BatchFlusher {
    buffer: Arc<BatchBuffer>,
    store: Arc<dyn TradeStore>,
    interval: Duration,
    wake: Notify,
}

impl std::fmt::Debug for BatchFlusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchFlusher")
            .field("interval", &self.interval)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

impl BatchFlusher {
    /// Create a flusher.
    #[must_use]
    pub fn new(buffer: Arc<BatchBuffer>, store: Arc<dyn TradeStore>, interval: Duration) -> Self {
        Self {
            buffer,
            store,
            interval,
            wake: Notify::new(),
        }
    }

    /// Buffer drained by this flusher.
    #[must_use]
    pub const fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    /// Flush interval.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Ask the running flush loop to flush now instead of waiting for the
    /// next tick.
    pub fn request_flush(&self) {
        self.wake.notify_one();
    }

    /// Drain the buffer and persist whatever was in it.
    ///
    /// Symbol groups the store cannot resolve are dropped and logged; they
    /// are not put back into the buffer. A store failure drops the whole
    /// batch. Never returns an error: faults are absorbed here.
    pub async fn flush_once(&self) -> FlushReport {
        let batch = self.buffer.drain_and_swap();
        metrics::set_buffered_records(self.buffer.len());
        if batch.is_empty() {
            return FlushReport::default();
        }

        let total = batch.len();
        let symbols = batch.symbol_count();
        let started = Instant::now();
        let result = self.store.append_batch(batch).await;
        metrics::record_flush_duration(started.elapsed());

        match result {
            Ok(report) => {
                for (symbol, count) in &report.skipped {
                    tracing::error!(
                        symbol = %symbol,
                        count,
                        "Symbol not found at flush time, dropping its records"
                    );
                }
                metrics::record_records_flushed(report.persisted as u64);
                if !report.skipped.is_empty() {
                    metrics::record_records_dropped(
                        DropReason::UnknownSymbol,
                        report.dropped() as u64,
                    );
                }
                tracing::info!(
                    persisted = report.persisted,
                    dropped = report.dropped(),
                    symbols,
                    "Flushed trade batch"
                );
                report
            }
            Err(e) => {
                tracing::error!(error = %e, count = total, "Failed to persist trade batch");
                metrics::record_records_dropped(DropReason::StoreError, total as u64);
                FlushReport::default()
            }
        }
    }

    /// Run the flush loop until cancelled. The first tick fires one interval
    /// after start.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!(interval_secs = self.interval.as_secs_f64(), "Flush loop started");

        loop {
            tokio::select! {
                biased;

                () = cancel.cancelled() => {
                    tracing::debug!("Flush loop stopped");
                    break;
                }

                _ = ticker.tick() => {
                    self.flush_once().await;
                }

                () = self.wake.notified() => {
                    tracing::debug!("Early flush requested");
                    self.flush_once().await;
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
