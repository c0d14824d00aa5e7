//! Subscription Session
//!
//! One session per live subscriber connection. Opening a session validates
//! the symbol, joins the fan-out broker and reads the latest stored trade
//! once; closing it (explicitly or by drop) leaves the broker.
//!
//! # Delivery Protocol
//!
//! Server to client, tagged by `type`:
//! - `initial_price`: latest stored trade, sent first if one exists
//! - `price_update`: each live trade
//! - `history_response`: reply to one `history_request`
//! - `malformed_request_error`: the request could not be understood
//!
//! Client to server:
//! - `{"type": "history_request", "limit": 5}` (`history` is accepted as an
//!   alias; `limit` defaults to 50 and is clamped to `1..=1000`)

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::application::ports::{MAX_RANGE_LIMIT, StoreError, TimeRange, TradeStore};
use crate::domain::trade::{Symbol, TradeRecord};
use crate::infrastructure::broadcast::{DeliveryReceiver, FanoutBroker, SubscriberId};

/// History limit used when a request does not name one.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

// =============================================================================
// Errors
// =============================================================================

/// Reasons a session cannot be opened.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The requested symbol is not registered.
    #[error("unknown symbol: {0}")]
    UnknownSymbol(Symbol),

    /// The symbol table could not be read.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// =============================================================================
// Protocol Messages
// =============================================================================

/// Price fields shared by `initial_price` and `price_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PricePayload {
    /// Symbol.
    pub symbol: Symbol,
    /// Trade price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Upstream trade time.
    pub timestamp: DateTime<Utc>,
    /// Upstream trade ID.
    pub trade_id: Option<i64>,
    /// Trade quantity.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub quantity: Option<Decimal>,
}

impl From<&TradeRecord> for PricePayload {
    fn from(record: &TradeRecord) -> Self {
        Self {
            symbol: record.symbol().clone(),
            price: record.price(),
            timestamp: record.timestamp(),
            trade_id: record.trade_id(),
            quantity: record.quantity(),
        }
    }
}

/// One record in a `history_response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Trade price.
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    /// Upstream trade time.
    pub timestamp: DateTime<Utc>,
    /// Upstream trade ID.
    pub trade_id: Option<i64>,
    /// Trade quantity.
    #[serde(with = "rust_decimal::serde::str_option")]
    pub quantity: Option<Decimal>,
}

impl From<&TradeRecord> for HistoryEntry {
    fn from(record: &TradeRecord) -> Self {
        Self {
            price: record.price(),
            timestamp: record.timestamp(),
            trade_id: record.trade_id(),
            quantity: record.quantity(),
        }
    }
}

/// Messages delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Latest stored price, sent once on open.
    InitialPrice(PricePayload),
    /// A live trade.
    PriceUpdate(PricePayload),
    /// Reply to a history request, newest first.
    HistoryResponse {
        /// Symbol.
        symbol: Symbol,
        /// Records.
        data: Vec<HistoryEntry>,
    },
    /// The last request could not be parsed.
    MalformedRequestError {
        /// Parser message.
        message: String,
    },
}

/// Requests a subscriber may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Ask for recent history.
    #[serde(alias = "history")]
    HistoryRequest {
        /// Number of records wanted.
        #[serde(default)]
        limit: Option<i64>,
    },
}

fn clamp_limit(limit: Option<i64>) -> usize {
    limit.map_or(DEFAULT_HISTORY_LIMIT, |l| {
        usize::try_from(l.max(1)).map_or(MAX_RANGE_LIMIT, |l| l.min(MAX_RANGE_LIMIT))
    })
}

// =============================================================================
// Live Feed
// =============================================================================

/// Stream of messages for one session: the initial price (if any) followed
/// by live updates.
#[derive(Debug)]
pub struct LiveFeed {
    initial: Option<ServerMessage>,
    rx: DeliveryReceiver,
}

impl LiveFeed {
    /// Next message to deliver. `None` means the session must close, either
    /// because the broker evicted it or because the broker is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        if let Some(initial) = self.initial.take() {
            return Some(initial);
        }
        self.rx
            .recv()
            .await
            .map(|record| ServerMessage::PriceUpdate(PricePayload::from(record.as_ref())))
    }

    /// Check if the broker evicted this feed.
    #[must_use]
    pub fn is_evicted(&self) -> bool {
        self.rx.is_evicted()
    }
}

// =============================================================================
// Session
// =============================================================================

/// A subscriber's membership in the broker for one symbol.
pub struct SubscriptionSession {
    symbol: Symbol,
    subscriber: SubscriberId,
    broker: Arc<FanoutBroker>,
    store: Arc<dyn TradeStore>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SubscriptionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSession")
            .field("symbol", &self.symbol)
            .field("subscriber", &self.subscriber)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SubscriptionSession {
    /// Open a session for `symbol`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSymbol` (without joining the broker) if the symbol is
    /// not registered, or `Store` if that check fails.
    pub async fn open(
        symbol: Symbol,
        broker: Arc<FanoutBroker>,
        store: Arc<dyn TradeStore>,
    ) -> Result<(Self, LiveFeed), SessionError> {
        if !store.symbol_exists(&symbol).await? {
            tracing::warn!(symbol = %symbol, "Subscriber requested unknown symbol");
            return Err(SessionError::UnknownSymbol(symbol));
        }

        let (channel, rx) = broker.channel();
        let subscriber = channel.id();
        broker.join(&symbol, channel);

        let session = Self {
            symbol,
            subscriber,
            broker,
            store,
            closed: AtomicBool::new(false),
        };

        let initial = match session.store.latest(&session.symbol).await {
            Ok(latest) => latest
                .as_ref()
                .map(|record| ServerMessage::InitialPrice(PricePayload::from(record))),
            Err(e) => {
                tracing::warn!(symbol = %session.symbol, error = %e, "Latest price unavailable");
                None
            }
        };

        tracing::info!(symbol = %session.symbol, subscriber = %subscriber, "Subscriber connected");
        Ok((session, LiveFeed { initial, rx }))
    }

    /// Symbol this session follows.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Broker identity of this session.
    #[must_use]
    pub const fn subscriber_id(&self) -> SubscriberId {
        self.subscriber
    }

    /// Answer one client request. Never fails: unparseable requests get a
    /// `malformed_request_error`, store failures an empty history.
    pub async fn handle_request(&self, text: &str) -> ServerMessage {
        let request = match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(symbol = %self.symbol, error = %e, "Malformed client request");
                return ServerMessage::MalformedRequestError {
                    message: e.to_string(),
                };
            }
        };

        match request {
            ClientRequest::HistoryRequest { limit } => self.history(clamp_limit(limit)).await,
        }
    }

    async fn history(&self, limit: usize) -> ServerMessage {
        let data = match self
            .store
            .range_query(&self.symbol, TimeRange::unbounded(), limit)
            .await
        {
            Ok(records) => records.iter().map(HistoryEntry::from).collect(),
            Err(e) => {
                tracing::warn!(symbol = %self.symbol, error = %e, "History read failed");
                Vec::new()
            }
        };

        ServerMessage::HistoryResponse {
            symbol: self.symbol.clone(),
            data,
        }
    }

    /// Leave the broker. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.leave(&self.symbol, self.subscriber);
            tracing::info!(symbol = %self.symbol, subscriber = %self.subscriber, "Subscriber disconnected");
        }
    }
}

impl Drop for SubscriptionSession {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use test_case::test_case;

    use super::*;
    use crate::application::ports::MockTradeStore;
    use crate::domain::batch::Batch;
    use crate::domain::trade::NewTrade;
    use crate::infrastructure::broadcast::BroadcastConfig;
    use crate::infrastructure::persistence::InMemoryTradeStore;

    fn trade(symbol: &str, price: &str, id: i64) -> TradeRecord {
        let mut new = NewTrade::new(
            Symbol::new(symbol),
            Decimal::from_str(price).unwrap(),
            DateTime::from_timestamp_millis(1_700_000_000_000 + id * 1000).unwrap(),
        );
        new.trade_id = Some(id);
        new.quantity = Some(Decimal::from_str("0.01").unwrap());
        TradeRecord::try_from(new).unwrap()
    }

    async fn store_with(symbol: &str, records: Vec<TradeRecord>) -> Arc<InMemoryTradeStore> {
        let store = Arc::new(InMemoryTradeStore::new());
        store.upsert_symbol(&Symbol::new(symbol)).await.unwrap();
        store
            .append_batch(records.into_iter().collect::<Batch>())
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn unknown_symbol_refused_without_join() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let store = Arc::new(InMemoryTradeStore::new());

        let result = SubscriptionSession::open(Symbol::new("nope"), Arc::clone(&broker), store).await;

        assert!(matches!(result, Err(SessionError::UnknownSymbol(_))));
        assert_eq!(broker.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn initial_price_then_live_updates() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let store = store_with("btcusdt", vec![trade("btcusdt", "49000.00", 1)]).await;

        let (session, mut feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), Arc::clone(&broker), store)
                .await
                .unwrap();
        assert_eq!(broker.subscriber_count(session.symbol()), 1);

        broker.publish(&Arc::new(trade("btcusdt", "50000.00", 2)));

        let Some(ServerMessage::InitialPrice(initial)) = feed.recv().await else {
            panic!("expected initial price");
        };
        assert_eq!(initial.price.to_string(), "49000.00");

        let Some(ServerMessage::PriceUpdate(update)) = feed.recv().await else {
            panic!("expected price update");
        };
        assert_eq!(update.trade_id, Some(2));
    }

    #[tokio::test]
    async fn no_initial_price_without_history() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let store = store_with("btcusdt", Vec::new()).await;

        let (_session, mut feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), Arc::clone(&broker), store)
                .await
                .unwrap();
        broker.publish(&Arc::new(trade("btcusdt", "1", 1)));

        assert!(matches!(feed.recv().await, Some(ServerMessage::PriceUpdate(_))));
    }

    #[tokio::test]
    async fn history_request_newest_first() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let records = (1..=10).map(|i| trade("btcusdt", "1", i)).collect();
        let store = store_with("btcusdt", records).await;

        let (session, _feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), broker, store)
                .await
                .unwrap();

        let reply = session
            .handle_request(r#"{"type":"history_request","limit":5}"#)
            .await;
        let ServerMessage::HistoryResponse { symbol, data } = reply else {
            panic!("expected history response");
        };
        assert_eq!(symbol.as_str(), "btcusdt");
        let ids: Vec<_> = data.iter().filter_map(|e| e.trade_id).collect();
        assert_eq!(ids, vec![10, 9, 8, 7, 6]);
    }

    #[tokio::test]
    async fn history_alias_and_default_limit() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let records = (1..=60).map(|i| trade("btcusdt", "1", i)).collect();
        let store = store_with("btcusdt", records).await;
        let (session, _feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), broker, store)
                .await
                .unwrap();

        let ServerMessage::HistoryResponse { data, .. } =
            session.handle_request(r#"{"type":"history"}"#).await
        else {
            panic!("expected history response");
        };
        assert_eq!(data.len(), DEFAULT_HISTORY_LIMIT);
    }

    #[test_case(r#"not json"# ; "not json")]
    #[test_case(r#"{"type":"subscribe"}"# ; "unknown type")]
    #[test_case(r#"{"limit":5}"# ; "missing type")]
    #[test_case(r#"{"type":"history_request","limit":"five"}"# ; "non numeric limit")]
    #[tokio::test]
    async fn malformed_requests_answered_with_error(text: &str) {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let store = store_with("btcusdt", Vec::new()).await;
        let (session, _feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), broker, store)
                .await
                .unwrap();

        assert!(matches!(
            session.handle_request(text).await,
            ServerMessage::MalformedRequestError { .. }
        ));
    }

    #[tokio::test]
    async fn history_store_failure_returns_empty() {
        let mut store = MockTradeStore::new();
        store.expect_symbol_exists().returning(|_| Ok(true));
        store.expect_latest().returning(|_| Ok(None));
        store
            .expect_range_query()
            .returning(|_, _, _| Err(StoreError::Unavailable("down".to_string())));

        let (session, _feed) = SubscriptionSession::open(
            Symbol::new("btcusdt"),
            Arc::new(FanoutBroker::with_defaults()),
            Arc::new(store),
        )
        .await
        .unwrap();

        let ServerMessage::HistoryResponse { data, .. } =
            session.handle_request(r#"{"type":"history_request"}"#).await
        else {
            panic!("expected history response");
        };
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn close_and_drop_leave_broker() {
        let broker = Arc::new(FanoutBroker::with_defaults());
        let store = store_with("btcusdt", Vec::new()).await;
        let symbol = Symbol::new("btcusdt");

        let (first, _f1) = SubscriptionSession::open(symbol.clone(), Arc::clone(&broker), store.clone())
            .await
            .unwrap();
        let (second, _f2) = SubscriptionSession::open(symbol.clone(), Arc::clone(&broker), store)
            .await
            .unwrap();
        assert_eq!(broker.subscriber_count(&symbol), 2);

        first.close();
        first.close();
        assert_eq!(broker.subscriber_count(&symbol), 1);

        drop(second);
        assert_eq!(broker.subscriber_count(&symbol), 0);
    }

    #[tokio::test]
    async fn evicted_feed_ends() {
        let broker = Arc::new(FanoutBroker::new(BroadcastConfig {
            subscriber_capacity: 1,
        }));
        let store = store_with("btcusdt", Vec::new()).await;

        let (_session, mut feed) =
            SubscriptionSession::open(Symbol::new("btcusdt"), Arc::clone(&broker), store)
                .await
                .unwrap();

        broker.publish(&Arc::new(trade("btcusdt", "1", 1)));
        broker.publish(&Arc::new(trade("btcusdt", "1", 2)));

        assert!(feed.is_evicted());
        assert!(feed.recv().await.is_none());
    }

    #[test]
    fn price_update_wire_shape() {
        let message = ServerMessage::PriceUpdate(PricePayload::from(&trade("btcusdt", "50000.00", 0)));
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["symbol"], "btcusdt");
        assert_eq!(json["price"], "50000.00");
        assert_eq!(json["quantity"], "0.01");
        assert_eq!(json["trade_id"], 0);
        assert!(json["timestamp"].as_str().unwrap().starts_with("2023-11-14T22:13:20"));
    }

    #[test_case(None, 50 ; "default")]
    #[test_case(Some(0), 1 ; "zero")]
    #[test_case(Some(-3), 1 ; "negative")]
    #[test_case(Some(5), 5 ; "in range")]
    #[test_case(Some(5000), 1000 ; "too large")]
    fn limit_clamped(limit: Option<i64>, expected: usize) {
        assert_eq!(clamp_limit(limit), expected);
    }
}
