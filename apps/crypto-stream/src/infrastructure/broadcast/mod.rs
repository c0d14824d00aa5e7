//! Fan-out Broker
//!
//! Delivers every published trade to each subscriber currently joined to the
//! trade's symbol.
//!
//! # Architecture
//!
//! The registry maps `Symbol -> {SubscriberId -> DeliveryChannel}` behind a
//! reader-many/writer-few lock: `publish` takes the read side, `join` and
//! `leave` take the write side. Each channel is a bounded mpsc queue written
//! with `try_send`, so `publish` never waits on a subscriber.
//!
//! A subscriber whose queue is full is evicted: its cancellation token fires,
//! the owning session observes it on its next receive, and the session's own
//! close path calls [`FanoutBroker::leave`]. Closed queues are skipped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::BroadcastSettings;
use crate::domain::trade::{Symbol, TradeRecord};
use crate::infrastructure::metrics;

/// Default per-subscriber queue depth.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

// =============================================================================
// Delivery Channels
// =============================================================================

/// Identity of one delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    /// Generate a fresh ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sending half of a subscriber's queue, held by the broker.
#[derive(Debug, Clone)]
pub struct DeliveryChannel {
    id: SubscriberId,
    tx: mpsc::Sender<Arc<TradeRecord>>,
    evicted: CancellationToken,
}

impl DeliveryChannel {
    /// Create a bounded channel pair.
    #[must_use]
    pub fn bounded(capacity: usize) -> (Self, DeliveryReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let evicted = CancellationToken::new();
        let id = SubscriberId::new();
        (
            Self {
                id,
                tx,
                evicted: evicted.clone(),
            },
            DeliveryReceiver { id, rx, evicted },
        )
    }

    /// Channel identity.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Check if the broker has evicted this channel.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

/// Receiving half of a subscriber's queue, held by the session.
#[derive(Debug)]
pub struct DeliveryReceiver {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<TradeRecord>>,
    evicted: CancellationToken,
}

impl DeliveryReceiver {
    /// Channel identity.
    #[must_use]
    pub const fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next record. Returns `None` once evicted or once the
    /// broker side is gone.
    pub async fn recv(&mut self) -> Option<Arc<TradeRecord>> {
        tokio::select! {
            biased;
            () = self.evicted.cancelled() => None,
            record = self.rx.recv() => record,
        }
    }

    /// Check if the broker has evicted this channel.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }
}

// =============================================================================
// Broker
// =============================================================================

/// Broker configuration.
#[derive(Debug, Clone, Copy)]
pub struct BroadcastConfig {
    /// Queue depth for each subscriber channel.
    pub subscriber_capacity: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

impl From<BroadcastSettings> for BroadcastConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            subscriber_capacity: settings.subscriber_capacity,
        }
    }
}

/// Outcome of one [`FanoutBroker::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Channels the record was queued to.
    pub delivered: usize,
    /// Channels skipped because they were closed or already evicted.
    pub dropped: usize,
    /// Channels evicted by this call for being full.
    pub evicted: usize,
}

type Registry = HashMap<Symbol, HashMap<SubscriberId, DeliveryChannel>>;

/// Per-symbol publish/subscribe registry.
///
/// # Example
///
/// ```rust
/// use crypto_stream::domain::trade::Symbol;
/// use crypto_stream::infrastructure::broadcast::FanoutBroker;
///
/// let broker = FanoutBroker::with_defaults();
/// let (channel, _rx) = broker.channel();
/// assert!(broker.join(&Symbol::new("btcusdt"), channel));
/// assert_eq!(broker.subscriber_count(&Symbol::new("btcusdt")), 1);
/// ```
#[derive(Debug, Default)]
pub struct FanoutBroker {
    registry: RwLock<Registry>,
    config: BroadcastConfig,
}

impl FanoutBroker {
    /// Create a broker.
    #[must_use]
    pub fn new(config: BroadcastConfig) -> Self {
        Self {
            registry: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create a broker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(BroadcastConfig::default())
    }

    /// Create a channel pair sized by the broker configuration.
    #[must_use]
    pub fn channel(&self) -> (DeliveryChannel, DeliveryReceiver) {
        DeliveryChannel::bounded(self.config.subscriber_capacity)
    }

    /// Register a channel under a symbol. Returns `false` if this channel was
    /// already joined to the symbol.
    pub fn join(&self, symbol: &Symbol, channel: DeliveryChannel) -> bool {
        let (added, total) = {
            let mut registry = self.registry.write();
            let members = registry.entry(symbol.clone()).or_default();
            let added = !members.contains_key(&channel.id);
            if added {
                members.insert(channel.id, channel);
            }
            (added, registry.values().map(HashMap::len).sum())
        };

        if added {
            metrics::set_active_subscribers(total);
            tracing::debug!(symbol = %symbol, subscribers = total, "Subscriber joined");
        }
        added
    }

    /// Remove a channel from a symbol. No-op if absent.
    pub fn leave(&self, symbol: &Symbol, id: SubscriberId) -> bool {
        let (removed, total) = {
            let mut registry = self.registry.write();
            let removed = registry
                .get_mut(symbol)
                .is_some_and(|members| members.remove(&id).is_some());
            if registry.get(symbol).is_some_and(HashMap::is_empty) {
                registry.remove(symbol);
            }
            (removed, registry.values().map(HashMap::len).sum())
        };

        if removed {
            metrics::set_active_subscribers(total);
            tracing::debug!(symbol = %symbol, subscribers = total, "Subscriber left");
        }
        removed
    }

    /// Queue a record to every channel joined to its symbol.
    ///
    /// Never blocks and never fails because of one channel.
    pub fn publish(&self, record: &Arc<TradeRecord>) -> PublishReport {
        let mut report = PublishReport::default();

        {
            let registry = self.registry.read();
            let Some(members) = registry.get(record.symbol()) else {
                return report;
            };

            for channel in members.values() {
                if channel.is_evicted() {
                    report.dropped += 1;
                    continue;
                }
                match channel.tx.try_send(Arc::clone(record)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        channel.evicted.cancel();
                        report.evicted += 1;
                        tracing::warn!(
                            symbol = %record.symbol(),
                            subscriber = %channel.id,
                            "Subscriber queue full, evicting"
                        );
                    }
                    Err(TrySendError::Closed(_)) => report.dropped += 1,
                }
            }
        }

        metrics::record_deliveries(
            report.delivered as u64,
            (report.dropped + report.evicted) as u64,
        );
        if report.evicted > 0 {
            metrics::record_subscribers_evicted(report.evicted as u64);
        }
        report
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Number of channels joined to a symbol.
    #[must_use]
    pub fn subscriber_count(&self, symbol: &Symbol) -> usize {
        self.registry.read().get(symbol).map_or(0, HashMap::len)
    }

    /// Number of channels across all symbols.
    #[must_use]
    pub fn total_subscribers(&self) -> usize {
        self.registry.read().values().map(HashMap::len).sum()
    }

    /// Symbols with at least one channel.
    #[must_use]
    pub fn active_symbols(&self) -> Vec<Symbol> {
        let mut symbols: Vec<_> = self.registry.read().keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Broker configuration.
    #[must_use]
    pub const fn config(&self) -> BroadcastConfig {
        self.config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use rust_decimal::Decimal;

    use super::*;
    use crate::domain::trade::NewTrade;

    fn record(symbol: &str, id: i64) -> Arc<TradeRecord> {
        let mut new = NewTrade::new(
            Symbol::new(symbol),
            Decimal::ONE,
            DateTime::from_timestamp_millis(id).unwrap(),
        );
        new.trade_id = Some(id);
        Arc::new(TradeRecord::try_from(new).unwrap())
    }

    #[tokio::test]
    async fn publish_reaches_joined_channels_only() {
        let broker = FanoutBroker::with_defaults();
        let btc = Symbol::new("btcusdt");
        let eth = Symbol::new("ethusdt");

        let (a, mut rx_a) = broker.channel();
        let (b, mut rx_b) = broker.channel();
        let (c, mut rx_c) = broker.channel();
        broker.join(&btc, a);
        broker.join(&btc, b);
        broker.join(&eth, c);

        let report = broker.publish(&record("btcusdt", 1));
        assert_eq!(report.delivered, 2);

        assert_eq!(rx_a.recv().await.unwrap().trade_id(), Some(1));
        assert_eq!(rx_b.recv().await.unwrap().trade_id(), Some(1));
        assert!(rx_c.rx.try_recv().is_err());
    }

    #[test]
    fn join_is_idempotent_per_channel() {
        let broker = FanoutBroker::with_defaults();
        let symbol = Symbol::new("btcusdt");
        let (channel, _rx) = broker.channel();

        assert!(broker.join(&symbol, channel.clone()));
        assert!(!broker.join(&symbol, channel));
        assert_eq!(broker.subscriber_count(&symbol), 1);
    }

    #[test]
    fn leave_absent_is_noop() {
        let broker = FanoutBroker::with_defaults();
        let symbol = Symbol::new("btcusdt");
        let (channel, _rx) = broker.channel();
        let id = channel.id();

        assert!(!broker.leave(&symbol, id));
        broker.join(&symbol, channel);
        assert!(broker.leave(&symbol, id));
        assert!(!broker.leave(&symbol, id));
        assert!(broker.active_symbols().is_empty());
    }

    #[tokio::test]
    async fn full_channel_evicted_others_still_delivered() {
        let broker = FanoutBroker::new(BroadcastConfig {
            subscriber_capacity: 1,
        });
        let symbol = Symbol::new("btcusdt");

        let (slow, mut slow_rx) = broker.channel();
        let (fast, mut fast_rx) = broker.channel();
        broker.join(&symbol, slow);
        broker.join(&symbol, fast);

        assert_eq!(broker.publish(&record("btcusdt", 1)).delivered, 2);
        assert_eq!(fast_rx.recv().await.unwrap().trade_id(), Some(1));

        let report = broker.publish(&record("btcusdt", 2));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 1);
        assert_eq!(fast_rx.recv().await.unwrap().trade_id(), Some(2));

        assert!(slow_rx.is_evicted());
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn closed_channel_skipped() {
        let broker = FanoutBroker::with_defaults();
        let symbol = Symbol::new("btcusdt");

        let (gone, gone_rx) = broker.channel();
        let (live, mut live_rx) = broker.channel();
        broker.join(&symbol, gone);
        broker.join(&symbol, live);
        drop(gone_rx);

        let report = broker.publish(&record("btcusdt", 7));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.dropped, 1);
        assert_eq!(live_rx.recv().await.unwrap().trade_id(), Some(7));
    }

    #[tokio::test]
    async fn order_preserved_per_channel() {
        let broker = FanoutBroker::with_defaults();
        let symbol = Symbol::new("btcusdt");
        let (a, mut rx_a) = broker.channel();
        let (b, mut rx_b) = broker.channel();
        broker.join(&symbol, a);
        broker.join(&symbol, b);

        for id in 0..20 {
            broker.publish(&record("btcusdt", id));
        }

        for rx in [&mut rx_a, &mut rx_b] {
            let mut seen = Vec::new();
            for _ in 0..20 {
                seen.push(rx.recv().await.unwrap().trade_id().unwrap());
            }
            assert_eq!(seen, (0..20).collect::<Vec<_>>());
        }
    }

    #[test]
    fn publish_without_subscribers_is_empty() {
        let broker = FanoutBroker::with_defaults();
        assert_eq!(
            broker.publish(&record("btcusdt", 1)),
            PublishReport::default()
        );
    }
}
