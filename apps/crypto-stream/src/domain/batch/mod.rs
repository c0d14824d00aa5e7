//! Batch Buffer
//!
//! Accumulates normalized trades per symbol until the next flush. The
//! ingestion loop is the only writer; the flush timer only ever swaps the
//! whole batch out, so `append` and `drain_and_swap` share a single lock and
//! every record lands in exactly one drained batch.
//!
//! # Bounding
//!
//! The buffer is unbounded unless a [`BufferLimit`] is configured. When the
//! limit is reached the configured [`OverflowPolicy`] decides whether the
//! oldest record is evicted, the incoming record is refused, or the record is
//! kept and an early flush is requested.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use super::trade::{Symbol, TradeRecord};

// =============================================================================
// Batch
// =============================================================================

/// Trades drained from the buffer, grouped by symbol in arrival order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    groups: HashMap<Symbol, Vec<TradeRecord>>,
    total: usize,
}

impl Batch {
    /// Create an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record to its symbol group.
    pub fn push(&mut self, record: TradeRecord) {
        self.groups
            .entry(record.symbol().clone())
            .or_default()
            .push(record);
        self.total += 1;
    }

    /// Check if the batch holds no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Total number of records across all symbols.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.total
    }

    /// Number of symbol groups.
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.groups.len()
    }

    /// Records buffered for one symbol, in arrival order.
    #[must_use]
    pub fn records(&self, symbol: &Symbol) -> &[TradeRecord] {
        self.groups.get(symbol).map_or(&[], Vec::as_slice)
    }

    /// Iterate over symbol groups.
    pub fn iter(&self) -> impl Iterator<Item = (&Symbol, &[TradeRecord])> {
        self.groups.iter().map(|(s, r)| (s, r.as_slice()))
    }

    /// Consume the batch into its symbol groups.
    #[must_use]
    pub fn into_groups(self) -> HashMap<Symbol, Vec<TradeRecord>> {
        self.groups
    }
}

impl FromIterator<TradeRecord> for Batch {
    fn from_iter<I: IntoIterator<Item = TradeRecord>>(iter: I) -> Self {
        let mut batch = Self::new();
        for record in iter {
            batch.push(record);
        }
        batch
    }
}

// =============================================================================
// Limits
// =============================================================================

/// What to do when a bounded buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered record to make room.
    DropOldest,
    /// Refuse the incoming record.
    DropNewest,
    /// Keep the record and ask for an immediate flush.
    #[default]
    FlushEarly,
}

impl OverflowPolicy {
    /// Parse a policy name (`drop_oldest`, `drop_newest`, `flush_early`).
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "drop_oldest" => Some(Self::DropOldest),
            "drop_newest" => Some(Self::DropNewest),
            "flush_early" => Some(Self::FlushEarly),
            _ => None,
        }
    }

    /// Policy name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::FlushEarly => "flush_early",
        }
    }
}

/// Upper bound on buffered records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimit {
    /// Maximum number of records held before the policy applies.
    pub max_records: usize,
    /// Overflow behavior.
    pub policy: OverflowPolicy,
}

/// Result of [`BatchBuffer::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Record buffered.
    Buffered,
    /// Record buffered; the buffer is at its limit and wants a flush now.
    FlushRequested,
    /// Record buffered after evicting the oldest buffered record.
    EvictedOldest(Box<TradeRecord>),
    /// Buffer full; the incoming record was not buffered.
    Rejected,
}

// =============================================================================
// Buffer
// =============================================================================

#[derive(Debug, Default)]
struct PendingTrades {
    groups: HashMap<Symbol, VecDeque<(u64, TradeRecord)>>,
    len: usize,
    next_seq: u64,
}

impl PendingTrades {
    fn push(&mut self, record: TradeRecord) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.groups
            .entry(record.symbol().clone())
            .or_default()
            .push_back((seq, record));
        self.len += 1;
    }

    fn pop_oldest(&mut self) -> Option<TradeRecord> {
        let symbol = self
            .groups
            .iter()
            .filter_map(|(symbol, queue)| queue.front().map(|(seq, _)| (*seq, symbol)))
            .min_by_key(|(seq, _)| *seq)
            .map(|(_, symbol)| symbol.clone())?;

        let queue = self.groups.get_mut(&symbol)?;
        let (_, record) = queue.pop_front()?;
        if queue.is_empty() {
            self.groups.remove(&symbol);
        }
        self.len -= 1;
        Some(record)
    }

    fn into_batch(self) -> Batch {
        let total = self.len;
        let groups = self
            .groups
            .into_iter()
            .map(|(symbol, queue)| (symbol, queue.into_iter().map(|(_, r)| r).collect()))
            .collect();
        Batch { groups, total }
    }
}

/// Per-symbol buffer of trades awaiting persistence.
///
/// # Example
///
/// ```rust
/// use crypto_stream::domain::batch::BatchBuffer;
///
/// let buffer = BatchBuffer::unbounded();
/// assert!(buffer.drain_and_swap().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct BatchBuffer {
    pending: Mutex<PendingTrades>,
    limit: Option<BufferLimit>,
}

impl BatchBuffer {
    /// Create a buffer with no size limit.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Create a buffer with an optional limit.
    #[must_use]
    pub fn new(limit: Option<BufferLimit>) -> Self {
        Self {
            pending: Mutex::new(PendingTrades::default()),
            limit,
        }
    }

    /// Add a record under its symbol. Never blocks on I/O and never fails;
    /// the outcome only reports what the overflow policy did.
    pub fn append(&self, record: TradeRecord) -> AppendOutcome {
        let mut pending = self.pending.lock();

        let Some(limit) = self.limit else {
            pending.push(record);
            return AppendOutcome::Buffered;
        };

        if pending.len < limit.max_records {
            pending.push(record);
            return if pending.len >= limit.max_records
                && limit.policy == OverflowPolicy::FlushEarly
            {
                AppendOutcome::FlushRequested
            } else {
                AppendOutcome::Buffered
            };
        }

        match limit.policy {
            OverflowPolicy::DropNewest => AppendOutcome::Rejected,
            OverflowPolicy::FlushEarly => {
                pending.push(record);
                AppendOutcome::FlushRequested
            }
            OverflowPolicy::DropOldest => {
                let evicted = pending.pop_oldest();
                pending.push(record);
                evicted.map_or(AppendOutcome::Buffered, |r| {
                    AppendOutcome::EvictedOldest(Box::new(r))
                })
            }
        }
    }

    /// Take the current batch, leaving an empty one in its place.
    #[must_use]
    pub fn drain_and_swap(&self) -> Batch {
        let drained = std::mem::take(&mut *self.pending.lock());
        drained.into_batch()
    }

    /// Number of records currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len
    }

    /// Check if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured limit, if any.
    #[must_use]
    pub const fn limit(&self) -> Option<BufferLimit> {
        self.limit
    }
}

// =============================================================================
// Tests
// =============================================================================
