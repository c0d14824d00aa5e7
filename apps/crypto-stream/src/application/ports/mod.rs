//! Port Interfaces
//!
//! Contracts the application layer needs from the outside world, following
//! the Hexagonal Architecture pattern. Infrastructure adapters implement
//! these.
//!
//! ## Driven Ports (Outbound)
//!
//! - `TradeStore`: durable symbol table plus append-only trade history

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use crate::domain::batch::Batch;
use crate::domain::trade::{Symbol, TradeRecord};

/// Default look-back for range queries.
pub const DEFAULT_RANGE_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Default number of records returned by a range query.
pub const DEFAULT_RANGE_LIMIT: usize = 100;

/// Largest limit accepted by any history read.
pub const MAX_RANGE_LIMIT: usize = 1000;

// =============================================================================
// Errors
// =============================================================================

/// Errors returned by a [`TradeStore`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The symbol is not registered.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    /// The backing store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store rejected the operation.
    #[error("store operation failed: {0}")]
    Backend(String),
}

// =============================================================================
// Value Types
// =============================================================================

/// A registered symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolHandle {
    /// Store-assigned identifier.
    pub id: u64,
    /// The symbol itself.
    pub symbol: Symbol,
    /// When the symbol was first registered.
    pub created_at: DateTime<Utc>,
}

/// Inclusive time window for range queries. Open ends are unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRange {
    /// Earliest timestamp included.
    pub start: Option<DateTime<Utc>>,
    /// Latest timestamp included.
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    /// A window with no bounds.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            start: None,
            end: None,
        }
    }

    /// The window `[now - window, now]`.
    #[must_use]
    pub fn last(window: Duration, now: DateTime<Utc>) -> Self {
        let start = chrono::Duration::from_std(window)
            .ok()
            .and_then(|w| now.checked_sub_signed(w));
        Self {
            start,
            end: Some(now),
        }
    }

    /// Check if a timestamp falls inside the window.
    #[must_use]
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| ts >= s) && self.end.is_none_or(|e| ts <= e)
    }
}

/// Outcome of appending a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Records durably appended.
    pub persisted: usize,
    /// Symbol groups that could not be resolved, with their record counts.
    pub skipped: Vec<(Symbol, usize)>,
}

impl FlushReport {
    /// Total records dropped across skipped groups.
    #[must_use]
    pub fn dropped(&self) -> usize {
        self.skipped.iter().map(|(_, n)| n).sum()
    }
}

/// Latest price and 24h change for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SymbolSummary {
    /// Symbol.
    pub symbol: Symbol,
    /// Most recent price.
    #[serde(with = "rust_decimal::serde::str")]
    pub current_price: Decimal,
    /// Timestamp of the most recent trade.
    pub last_update: DateTime<Utc>,
    /// Absolute change against the price 24h earlier.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub price_change_24h: Option<Decimal>,
    /// Percent change against the price 24h earlier, two decimal places.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub price_change_percent_24h: Option<Decimal>,
}

impl SymbolSummary {
    /// Build a summary from the latest record and the reference record from
    /// 24h earlier, if one exists.
    #[must_use]
    pub fn from_records(latest: &TradeRecord, day_ago: Option<&TradeRecord>) -> Self {
        let current = latest.price();
        let (change, percent) = match day_ago.map(TradeRecord::price) {
            Some(old) => {
                let change = current - old;
                let percent = if old.is_zero() {
                    None
                } else {
                    Some((change / old * Decimal::ONE_HUNDRED).round_dp(2))
                };
                (Some(change), percent)
            }
            None => (None, None),
        };

        Self {
            symbol: latest.symbol().clone(),
            current_price: current,
            last_update: latest.timestamp(),
            price_change_24h: change,
            price_change_percent_24h: percent,
        }
    }
}

// =============================================================================
// Trade Store Port
// =============================================================================

/// Durable store keyed by symbol with append-only trade history.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Register a symbol, returning the existing handle if already present.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be written.
    async fn upsert_symbol(&self, symbol: &Symbol) -> Result<SymbolHandle, StoreError>;

    /// Check whether a symbol is registered.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn symbol_exists(&self, symbol: &Symbol) -> Result<bool, StoreError>;

    /// List every registered symbol.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn symbols(&self) -> Result<Vec<SymbolHandle>, StoreError>;

    /// Append a batch. Groups whose symbol is not registered are skipped and
    /// reported; the rest of the batch still commits.
    ///
    /// # Errors
    ///
    /// Returns error only when nothing could be written.
    async fn append_batch(&self, batch: Batch) -> Result<FlushReport, StoreError>;

    /// Most recent record for a symbol by trade timestamp.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn latest(&self, symbol: &Symbol) -> Result<Option<TradeRecord>, StoreError>;

    /// Records inside `range`, newest first, at most `limit` of them.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn range_query(
        &self,
        symbol: &Symbol,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError>;

    /// Per-symbol price summary as of `now`.
    ///
    /// # Errors
    ///
    /// Returns error if the store cannot be read.
    async fn summary(&self, now: DateTime<Utc>) -> Result<Vec<SymbolSummary>, StoreError>;
}
