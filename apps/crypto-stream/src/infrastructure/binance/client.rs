//! Stream Ingestion Client
//!
//! Owns the single upstream connection to Binance's trade stream and drives
//! every received trade into the batch buffer and the fan-out broker.
//!
//! # Stream URL
//!
//! - Production: `wss://stream.binance.com:9443/ws`
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Receiving -> Reconnecting -> Connecting ...
//!                                                 \-> Closing -> Disconnected
//! ```
//!
//! One combined `SUBSCRIBE` request names every configured symbol. On entry
//! to `Subscribed` every configured symbol is upserted into the trade store
//! before any message is processed. On stop, the buffer is flushed before
//! the close frame is sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::codec::{NormalizeError, TradeNormalizer, UpstreamEvent};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
use super::messages::StreamRequest;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::UpstreamSettings;
use crate::application::ports::{StoreError, TradeStore};
use crate::application::services::flush::BatchFlusher;
use crate::domain::batch::AppendOutcome;
use crate::domain::trade::{Symbol, TradeRecord};
use crate::infrastructure::broadcast::FanoutBroker;
use crate::infrastructure::metrics::{self, DropReason, RejectReason};

/// Default upstream endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://stream.binance.com:9443/ws";

// =============================================================================
// Error Type
// =============================================================================

/// Errors that can occur in the ingestion client.
#[derive(Debug, thiserror::Error)]
pub enum IngestionError {
    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Subscription request could not be built.
    #[error("subscribe request failed: {0}")]
    Subscribe(String),

    /// Symbol registration failed.
    #[error("symbol registration failed: {0}")]
    Store(#[from] StoreError),

    /// Upstream went silent.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),

    /// Connection closed by the server.
    #[error("connection closed")]
    ConnectionClosed,

    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),

    /// A background task panicked or was aborted.
    #[error("task failed: {0}")]
    TaskFailed(String),
}

// =============================================================================
// Connection State
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Not connected.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Subscribe request sent, symbols being registered.
    Subscribed,
    /// Steady state.
    Receiving,
    /// Waiting out a reconnect delay.
    Reconnecting,
    /// Final flush and transport teardown.
    Closing,
}

impl ConnectionState {
    /// State name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Receiving => "receiving",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable state of the upstream feed, shared with the health server.
#[derive(Debug)]
pub struct FeedState {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    reconnect_attempts: AtomicU32,
    messages_received: AtomicU64,
    trades_received: AtomicU64,
}

impl Default for FeedState {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedState {
    /// Create state in `Disconnected`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            reconnect_attempts: AtomicU32::new(0),
            messages_received: AtomicU64::new(0),
            trades_received: AtomicU64::new(0),
        }
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        if state == ConnectionState::Receiving {
            *self.last_connected_at.write() = Some(Utc::now());
            *self.last_error.write() = None;
            self.reconnect_attempts.store(0, Ordering::Relaxed);
        }
    }

    /// Record the last transport error.
    pub fn set_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// When the client last reached `Receiving`.
    #[must_use]
    pub fn last_connected_at(&self) -> Option<DateTime<Utc>> {
        *self.last_connected_at.read()
    }

    /// Last transport error since the most recent successful connection.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Consecutive reconnect attempts.
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::Relaxed)
    }

    /// Total upstream text frames received.
    #[must_use]
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    /// Total trades normalized.
    #[must_use]
    pub fn trades_received(&self) -> u64 {
        self.trades_received.load(Ordering::Relaxed)
    }

    fn increment_reconnect_attempts(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_trades(&self) {
        self.trades_received.fetch_add(1, Ordering::Relaxed);
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the ingestion client.
#[derive(Debug, Clone)]
pub struct IngestionClientConfig {
    /// WebSocket URL.
    pub url: String,
    /// Symbols to subscribe to.
    pub symbols: Vec<Symbol>,
    /// Reconnection configuration.
    pub reconnect: ReconnectConfig,
    /// Heartbeat configuration.
    pub heartbeat: HeartbeatConfig,
}

impl IngestionClientConfig {
    /// Create a configuration with default reconnect and heartbeat settings.
    #[must_use]
    pub fn new(url: impl Into<String>, symbols: Vec<Symbol>) -> Self {
        Self {
            url: url.into(),
            symbols,
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub fn from_settings(settings: &UpstreamSettings, symbols: Vec<Symbol>) -> Self {
        Self {
            url: settings.url.clone(),
            symbols,
            reconnect: ReconnectConfig::from_upstream_settings(settings),
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
        }
    }
}

// =============================================================================
// Ingestion Client
// =============================================================================

/// Upstream trade stream client.
///
/// Manages the connection lifecycle including:
/// - Combined-stream subscription
/// - Symbol registration
/// - Heartbeat monitoring
/// - Automatic reconnection
/// - Flush-before-close on shutdown
pub struct IngestionClient {
    config: IngestionClientConfig,
    normalizer: TradeNormalizer,
    flusher: Arc<BatchFlusher>,
    broker: Arc<FanoutBroker>,
    store: Arc<dyn TradeStore>,
    state: Arc<FeedState>,
    cancel: CancellationToken,
    request_id: AtomicU64,
}

impl std::fmt::Debug for IngestionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionClient")
            .field("config", &self.config)
            .field("state", &self.state.state())
            .finish_non_exhaustive()
    }
}

impl IngestionClient {
    /// Create a new ingestion client.
    #[must_use]
    pub fn new(
        config: IngestionClientConfig,
        flusher: Arc<BatchFlusher>,
        broker: Arc<FanoutBroker>,
        store: Arc<dyn TradeStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            normalizer: TradeNormalizer::new(),
            flusher,
            broker,
            store,
            state: Arc::new(FeedState::new()),
            cancel,
            request_id: AtomicU64::new(0),
        }
    }

    /// Shared feed state for health reporting.
    #[must_use]
    pub fn feed_state(&self) -> Arc<FeedState> {
        Arc::clone(&self.state)
    }

    /// Spawn the ingestion loop and the flush loop.
    #[must_use]
    pub fn start(self: Arc<Self>) -> IngestionHandle {
        let cancel = self.cancel.clone();
        let flusher = tokio::spawn(Arc::clone(&self.flusher).run(cancel.clone()));
        let client = tokio::spawn(self.run());
        IngestionHandle {
            cancel,
            client,
            flusher,
        }
    }

    /// Run the connection loop until cancelled.
    ///
    /// Transport failures are retried according to the reconnect policy.
    /// Whatever the exit path, buffered trades are flushed before returning.
    ///
    /// # Errors
    ///
    /// Returns `MaxReconnectAttemptsExceeded` if a finite attempt limit is
    /// configured and exhausted. The client's cancellation token is cancelled
    /// in that case so the rest of the process shuts down with it.
    pub async fn run(self: Arc<Self>) -> Result<(), IngestionError> {
        let mut policy = ReconnectPolicy::new(self.config.reconnect);

        let result = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }

            match self.connect_and_run(&mut policy).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "Upstream connection lost");
                    self.state.set_error(e.to_string());

                    if self.cancel.is_cancelled() {
                        break Ok(());
                    }

                    let Some(delay) = policy.next_delay() else {
                        break Err(IngestionError::MaxReconnectAttemptsExceeded(
                            policy.attempt_count(),
                        ));
                    };

                    self.state.set_state(ConnectionState::Reconnecting);
                    self.state.increment_reconnect_attempts();
                    metrics::record_reconnect();
                    tracing::info!(
                        attempt = policy.attempt_count(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Reconnecting to upstream"
                    );

                    tokio::select! {
                        () = self.cancel.cancelled() => {
                            tracing::info!("Ingestion client cancelled during reconnect delay");
                            break Ok(());
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };

        if let Err(e) = &result {
            tracing::error!(error = %e, "Ingestion client giving up, requesting shutdown");
            self.cancel.cancel();
        }

        self.state.set_state(ConnectionState::Closing);
        self.flusher.flush_once().await;
        self.state.set_state(ConnectionState::Disconnected);
        tracing::info!("Ingestion client stopped");
        result
    }

    /// Connect, subscribe and receive until error or cancellation.
    async fn connect_and_run(&self, policy: &mut ReconnectPolicy) -> Result<(), IngestionError> {
        self.state.set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting to upstream trade stream");

        let (ws_stream, _response) = tokio::select! {
            () = self.cancel.cancelled() => return Ok(()),
            connected = tokio_tungstenite::connect_async(self.config.url.as_str()) => connected?,
        };
        let (mut write, mut read) = ws_stream.split();

        let request = StreamRequest::subscribe_trades(&self.config.symbols, self.next_request_id());
        let json =
            serde_json::to_string(&request).map_err(|e| IngestionError::Subscribe(e.to_string()))?;
        write.send(Message::Text(json.into())).await?;
        self.state.set_state(ConnectionState::Subscribed);

        self.register_symbols().await?;

        policy.reset();
        self.state.set_state(ConnectionState::Receiving);
        tracing::info!(
            symbols = self.config.symbols.len(),
            "Subscribed to upstream trade streams"
        );

        let mut heartbeat = HeartbeatMonitor::new(self.config.heartbeat);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => {
                    self.state.set_state(ConnectionState::Closing);
                    self.flusher.flush_once().await;
                    let unsubscribe =
                        StreamRequest::unsubscribe_trades(&self.config.symbols, self.next_request_id());
                    if let Ok(json) = serde_json::to_string(&unsubscribe) {
                        let _ = write.send(Message::Text(json.into())).await;
                    }
                    if let Err(e) = write.send(Message::Close(None)).await {
                        tracing::debug!(error = %e, "Close frame not sent");
                    }
                    return Ok(());
                }

                event = heartbeat.tick() => {
                    match event {
                        HeartbeatEvent::SendPing => {
                            write.send(Message::Ping(Vec::<u8>::new().into())).await?;
                        }
                        HeartbeatEvent::Timeout(idle) => {
                            return Err(IngestionError::HeartbeatTimeout(idle));
                        }
                    }
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            heartbeat.record_activity();
                            self.handle_text(&text);
                        }
                        Some(Ok(Message::Binary(data))) => {
                            heartbeat.record_activity();
                            match std::str::from_utf8(&data) {
                                Ok(text) => self.handle_text(text),
                                Err(e) => {
                                    self.state.increment_messages();
                                    metrics::record_message_received();
                                    metrics::record_message_rejected(RejectReason::Malformed);
                                    tracing::warn!(error = %e, "Dropping non-UTF-8 binary frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            heartbeat.record_activity();
                            write.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            tracing::info!(frame = ?frame, "Server sent close frame");
                            return Err(IngestionError::ConnectionClosed);
                        }
                        Some(Ok(_)) => {
                            heartbeat.record_activity();
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            tracing::info!("Upstream stream ended");
                            return Err(IngestionError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Upsert every configured symbol.
    async fn register_symbols(&self) -> Result<(), StoreError> {
        for symbol in &self.config.symbols {
            self.store.upsert_symbol(symbol).await?;
        }
        tracing::debug!(count = self.config.symbols.len(), "Registered configured symbols");
        Ok(())
    }

    /// Normalize one text frame and route the result.
    fn handle_text(&self, text: &str) {
        self.state.increment_messages();
        metrics::record_message_received();

        match self.normalizer.normalize(text) {
            Ok(UpstreamEvent::Trade(record)) => self.ingest(record),
            Ok(UpstreamEvent::Ignored { event_type }) => {
                metrics::record_message_rejected(RejectReason::Ignored);
                tracing::trace!(event_type = ?event_type, "Ignoring non-trade message");
            }
            Err(e @ NormalizeError::MalformedPayload(_)) => {
                metrics::record_message_rejected(RejectReason::Malformed);
                tracing::warn!(error = %e, "Dropping upstream message");
            }
            Err(e @ NormalizeError::InvalidTradeFields(_)) => {
                metrics::record_message_rejected(RejectReason::InvalidFields);
                tracing::warn!(error = %e, "Dropping upstream trade");
            }
        }
    }

    /// Append to the buffer and publish to subscribers.
    fn ingest(&self, record: TradeRecord) {
        self.state.increment_trades();
        metrics::record_trade_normalized();

        let live = Arc::new(record.clone());
        match self.flusher.buffer().append(record) {
            AppendOutcome::Buffered => {}
            AppendOutcome::FlushRequested => self.flusher.request_flush(),
            AppendOutcome::EvictedOldest(evicted) => {
                metrics::record_records_dropped(DropReason::BufferOverflow, 1);
                tracing::warn!(
                    symbol = %evicted.symbol(),
                    trade_id = ?evicted.trade_id(),
                    "Buffer full, evicted oldest trade"
                );
            }
            AppendOutcome::Rejected => {
                metrics::record_records_dropped(DropReason::BufferOverflow, 1);
                tracing::warn!(
                    symbol = %live.symbol(),
                    trade_id = ?live.trade_id(),
                    "Buffer full, trade not buffered"
                );
            }
        }
        metrics::set_buffered_records(self.flusher.buffer().len());

        self.broker.publish(&live);
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Running ingestion and flush tasks.
#[derive(Debug)]
pub struct IngestionHandle {
    cancel: CancellationToken,
    client: JoinHandle<Result<(), IngestionError>>,
    flusher: JoinHandle<()>,
}

impl IngestionHandle {
    /// Token that stops both tasks.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check if the ingestion task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.client.is_finished()
    }

    /// Stop both tasks and wait for the final flush.
    ///
    /// # Errors
    ///
    /// Returns the ingestion loop's error, or `TaskFailed` if a task panicked.
    pub async fn shutdown(self) -> Result<(), IngestionError> {
        self.cancel.cancel();
        let client = self.client.await;
        if let Err(e) = self.flusher.await {
            tracing::error!(error = %e, "Flush task failed");
        }
        client.map_err(|e| IngestionError::TaskFailed(e.to_string()))?
    }
}

// =============================================================================
// Tests
// =============================================================================
