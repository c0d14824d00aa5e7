//! In-memory trade store.

use std::cmp::Reverse;
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::application::ports::{
    DEFAULT_RANGE_WINDOW, FlushReport, StoreError, SymbolHandle, SymbolSummary, TimeRange,
    TradeStore,
};
use crate::domain::batch::Batch;
use crate::domain::trade::{Symbol, TradeRecord};

#[derive(Debug, Default)]
struct StoreState {
    symbols: HashMap<Symbol, SymbolHandle>,
    trades: HashMap<Symbol, Vec<TradeRecord>>,
    next_id: u64,
}

/// In-memory implementation of `TradeStore`.
///
/// Trades are kept per symbol in append order. Suitable for tests and
/// single-process deployments where history does not need to survive a
/// restart.
#[derive(Debug, Default)]
pub struct InMemoryTradeStore {
    state: RwLock<StoreState>,
}

impl InMemoryTradeStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored trades.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().trades.values().map(Vec::len).sum()
    }

    /// Check if no trades are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of stored trades for one symbol.
    #[must_use]
    pub fn count(&self, symbol: &Symbol) -> usize {
        self.state.read().trades.get(symbol).map_or(0, Vec::len)
    }

    /// Remove a symbol and all of its trades. Returns whether it existed.
    pub fn remove_symbol(&self, symbol: &Symbol) -> bool {
        let mut state = self.state.write();
        state.trades.remove(symbol);
        state.symbols.remove(symbol).is_some()
    }
}

fn latest_of<'a>(records: impl Iterator<Item = &'a TradeRecord>) -> Option<&'a TradeRecord> {
    // max_by_key keeps the last maximum, so the later append wins ties.
    records.max_by_key(|r| r.timestamp())
}

#[async_trait]
impl TradeStore for InMemoryTradeStore {
    async fn upsert_symbol(&self, symbol: &Symbol) -> Result<SymbolHandle, StoreError> {
        let mut state = self.state.write();
        if let Some(handle) = state.symbols.get(symbol) {
            return Ok(handle.clone());
        }
        state.next_id += 1;
        let handle = SymbolHandle {
            id: state.next_id,
            symbol: symbol.clone(),
            created_at: Utc::now(),
        };
        state.symbols.insert(symbol.clone(), handle.clone());
        Ok(handle)
    }

    async fn symbol_exists(&self, symbol: &Symbol) -> Result<bool, StoreError> {
        Ok(self.state.read().symbols.contains_key(symbol))
    }

    async fn symbols(&self) -> Result<Vec<SymbolHandle>, StoreError> {
        let state = self.state.read();
        let mut handles: Vec<_> = state.symbols.values().cloned().collect();
        handles.sort_by_key(|h| h.id);
        Ok(handles)
    }

    async fn append_batch(&self, batch: Batch) -> Result<FlushReport, StoreError> {
        let mut state = self.state.write();
        let mut report = FlushReport::default();

        for (symbol, records) in batch.into_groups() {
            if !state.symbols.contains_key(&symbol) {
                report.skipped.push((symbol, records.len()));
                continue;
            }
            report.persisted += records.len();
            state.trades.entry(symbol).or_default().extend(records);
        }

        report.skipped.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(report)
    }

    async fn latest(&self, symbol: &Symbol) -> Result<Option<TradeRecord>, StoreError> {
        let state = self.state.read();
        Ok(state
            .trades
            .get(symbol)
            .and_then(|records| latest_of(records.iter()))
            .cloned())
    }

    async fn range_query(
        &self,
        symbol: &Symbol,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        let state = self.state.read();
        let Some(records) = state.trades.get(symbol) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<&TradeRecord> = records
            .iter()
            .rev()
            .filter(|r| range.contains(r.timestamp()))
            .collect();
        matched.sort_by_key(|r| Reverse(r.timestamp()));

        Ok(matched.into_iter().take(limit).cloned().collect())
    }

    async fn summary(&self, now: DateTime<Utc>) -> Result<Vec<SymbolSummary>, StoreError> {
        let state = self.state.read();
        let cutoff = TimeRange::last(DEFAULT_RANGE_WINDOW, now).start;

        let mut summaries: Vec<_> = state
            .trades
            .values()
            .filter_map(|records| {
                let latest = latest_of(records.iter())?;
                let day_ago = cutoff.and_then(|cutoff| {
                    latest_of(records.iter().filter(|r| r.timestamp() <= cutoff))
                });
                Some(SymbolSummary::from_records(latest, day_ago))
            })
            .collect();
        summaries.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        Ok(summaries)
    }
}
