//! Subscriber WebSocket Integration Tests
//!
//! Runs the subscriber server on a local port against an in-process broker
//! and store, and talks to it with a plain WebSocket client.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crypto_stream::application::ports::{
    FlushReport, StoreError, SymbolHandle, SymbolSummary, TimeRange,
};
use crypto_stream::{
    Batch, BatchBuffer, BatchFlusher, BroadcastConfig, FanoutBroker, InMemoryTradeStore, NewTrade,
    SubscriberServer, SubscriberServerState, Symbol, TradeRecord, TradeStore,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    addr: std::net::SocketAddr,
    store: Arc<InMemoryTradeStore>,
    broker: Arc<FanoutBroker>,
    cancel: CancellationToken,
}

async fn seeded_store() -> Arc<InMemoryTradeStore> {
    let store = Arc::new(InMemoryTradeStore::new());
    store.upsert_symbol(&Symbol::new("btcusdt")).await.unwrap();
    store.upsert_symbol(&Symbol::new("ethusdt")).await.unwrap();
    store
}

async fn serve(
    store: Arc<InMemoryTradeStore>,
    served: Arc<dyn TradeStore>,
    broker: FanoutBroker,
) -> Harness {
    let broker = Arc::new(broker);
    let cancel = CancellationToken::new();
    let state = Arc::new(SubscriberServerState::new(
        Arc::clone(&broker),
        served,
        cancel.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(SubscriberServer::new(addr.port(), state).serve(listener));

    Harness {
        addr,
        store,
        broker,
        cancel,
    }
}

async fn harness() -> Harness {
    let store = seeded_store().await;
    let served: Arc<dyn TradeStore> = store.clone();
    serve(store, served, FanoutBroker::with_defaults()).await
}

/// Store whose history reads wait until released.
struct SlowHistoryStore {
    inner: Arc<InMemoryTradeStore>,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl TradeStore for SlowHistoryStore {
    async fn upsert_symbol(&self, symbol: &Symbol) -> Result<SymbolHandle, StoreError> {
        self.inner.upsert_symbol(symbol).await
    }

    async fn symbol_exists(&self, symbol: &Symbol) -> Result<bool, StoreError> {
        self.inner.symbol_exists(symbol).await
    }

    async fn symbols(&self) -> Result<Vec<SymbolHandle>, StoreError> {
        self.inner.symbols().await
    }

    async fn append_batch(&self, batch: Batch) -> Result<FlushReport, StoreError> {
        self.inner.append_batch(batch).await
    }

    async fn latest(&self, symbol: &Symbol) -> Result<Option<TradeRecord>, StoreError> {
        self.inner.latest(symbol).await
    }

    async fn range_query(
        &self,
        symbol: &Symbol,
        range: TimeRange,
        limit: usize,
    ) -> Result<Vec<TradeRecord>, StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.inner.range_query(symbol, range, limit).await
    }

    async fn summary(&self, now: DateTime<Utc>) -> Result<Vec<SymbolSummary>, StoreError> {
        self.inner.summary(now).await
    }
}

fn trade(symbol: &str, id: i64, price: &str) -> TradeRecord {
    let mut new = NewTrade::new(
        Symbol::new(symbol),
        Decimal::from_str(price).unwrap(),
        DateTime::from_timestamp_millis(1_700_000_000_000 + id * 1000).unwrap(),
    );
    new.trade_id = Some(id);
    new.quantity = Some(Decimal::from_str("0.01").unwrap());
    TradeRecord::try_from(new).unwrap()
}

async fn connect(harness: &Harness, symbol: &str) -> Client {
    let url = format!("ws://{}/ws/crypto/{symbol}", harness.addr);
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

async fn wait_subscribers(harness: &Harness, symbol: &str, count: usize) {
    let symbol = Symbol::new(symbol);
    timeout(Duration::from_secs(5), async {
        while harness.broker.subscriber_count(&symbol) != count {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("subscriber count not reached");
}

async fn next_json(ws: &mut Client) -> serde_json::Value {
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no message in time")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn live_trade_delivered_as_price_update() {
    let harness = harness().await;
    let mut ws = connect(&harness, "BTCUSDT").await;
    wait_subscribers(&harness, "btcusdt", 1).await;

    harness
        .broker
        .publish(&Arc::new(trade("btcusdt", 12345, "50000.00")));

    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "price_update");
    assert_eq!(json["symbol"], "btcusdt");
    assert_eq!(json["price"], "50000.00");
    assert_eq!(json["quantity"], "0.01");
    assert_eq!(json["trade_id"], 12345);
}

#[tokio::test]
async fn other_symbols_not_delivered() {
    let harness = harness().await;
    let mut btc = connect(&harness, "btcusdt").await;
    wait_subscribers(&harness, "btcusdt", 1).await;

    harness.broker.publish(&Arc::new(trade("ethusdt", 1, "3000")));
    harness.broker.publish(&Arc::new(trade("btcusdt", 2, "50000")));

    let json = next_json(&mut btc).await;
    assert_eq!(json["symbol"], "btcusdt");
    assert_eq!(json["trade_id"], 2);
}

#[tokio::test]
async fn initial_price_reflects_latest_flushed_trade() {
    let harness = harness().await;
    let dyn_store: Arc<dyn TradeStore> = harness.store.clone();
    let buffer = Arc::new(BatchBuffer::unbounded());
    let flusher = BatchFlusher::new(Arc::clone(&buffer), dyn_store, Duration::from_secs(10));

    let _ = buffer.append(trade("ethusdt", 1, "2999.50"));
    let _ = buffer.append(trade("ethusdt", 2, "3001.25"));
    assert_eq!(flusher.flush_once().await.persisted, 2);

    let mut ws = connect(&harness, "ethusdt").await;
    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "initial_price");
    assert_eq!(json["price"], "3001.25");
    assert_eq!(json["trade_id"], 2);
}

#[tokio::test]
async fn history_request_returns_newest_first() {
    let harness = harness().await;
    let batch: Batch = (1..=10).map(|id| trade("btcusdt", id, "100")).collect();
    harness.store.append_batch(batch).await.unwrap();

    let mut ws = connect(&harness, "btcusdt").await;
    assert_eq!(next_json(&mut ws).await["type"], "initial_price");

    ws.send(Message::Text(r#"{"type":"history_request","limit":5}"#.into()))
        .await
        .unwrap();

    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "history_response");
    assert_eq!(json["symbol"], "btcusdt");
    let ids: Vec<i64> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["trade_id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![10, 9, 8, 7, 6]);
}

#[tokio::test]
async fn malformed_request_keeps_connection_open() {
    let harness = harness().await;
    let mut ws = connect(&harness, "btcusdt").await;
    wait_subscribers(&harness, "btcusdt", 1).await;

    ws.send(Message::Text("hello".into())).await.unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "malformed_request_error");

    harness.broker.publish(&Arc::new(trade("btcusdt", 7, "1")));
    assert_eq!(next_json(&mut ws).await["type"], "price_update");
}

#[tokio::test]
async fn unknown_symbol_closed_with_policy_violation() {
    let harness = harness().await;
    let mut ws = connect(&harness, "dogeusdt").await;

    let message = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no close in time")
        .expect("stream ended")
        .unwrap();
    let Message::Close(Some(frame)) = message else {
        panic!("expected close frame, got {message:?}");
    };
    assert_eq!(u16::from(frame.code), 1008);
    assert_eq!(harness.broker.total_subscribers(), 0);
}

#[tokio::test]
async fn disconnect_leaves_broker() {
    let harness = harness().await;
    let mut ws = connect(&harness, "btcusdt").await;
    wait_subscribers(&harness, "btcusdt", 1).await;

    ws.close(None).await.unwrap();
    wait_subscribers(&harness, "btcusdt", 0).await;

    let report = harness.broker.publish(&Arc::new(trade("btcusdt", 1, "1")));
    assert_eq!(report.delivered, 0);
}

#[tokio::test]
async fn server_shutdown_closes_sessions() {
    let harness = harness().await;
    let mut ws = connect(&harness, "btcusdt").await;
    wait_subscribers(&harness, "btcusdt", 1).await;

    harness.cancel.cancel();

    let closed = timeout(Duration::from_secs(5), async {
        while let Some(Ok(message)) = ws.next().await {
            if matches!(message, Message::Close(_)) {
                return true;
            }
        }
        true
    })
    .await
    .unwrap();
    assert!(closed);
    wait_subscribers(&harness, "btcusdt", 0).await;
}

#[tokio::test]
async fn live_updates_flow_while_history_read_pending() {
    let store = seeded_store().await;
    let batch: Batch = (1..=3).map(|id| trade("btcusdt", id, "100")).collect();
    store.append_batch(batch).await.unwrap();

    let slow = Arc::new(SlowHistoryStore {
        inner: Arc::clone(&store),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let served: Arc<dyn TradeStore> = slow.clone();
    let broker = FanoutBroker::new(BroadcastConfig {
        subscriber_capacity: 4,
    });
    let harness = serve(store, served, broker).await;

    let mut ws = connect(&harness, "btcusdt").await;
    assert_eq!(next_json(&mut ws).await["type"], "initial_price");
    wait_subscribers(&harness, "btcusdt", 1).await;

    ws.send(Message::Text(r#"{"type":"history_request","limit":10}"#.into()))
        .await
        .unwrap();
    timeout(Duration::from_secs(5), slow.entered.notified())
        .await
        .expect("history read not started");

    // More trades than the queue holds, each delivered before the next.
    for id in 100..110 {
        let report = harness.broker.publish(&Arc::new(trade("btcusdt", id, "101")));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, 0);

        let json = next_json(&mut ws).await;
        assert_eq!(json["type"], "price_update");
        assert_eq!(json["trade_id"], id);
    }

    slow.release.notify_one();

    let json = next_json(&mut ws).await;
    assert_eq!(json["type"], "history_response");
    assert_eq!(json["data"].as_array().unwrap().len(), 3);
    assert_eq!(harness.broker.subscriber_count(&Symbol::new("btcusdt")), 1);
}
