//! Binance WebSocket Adapters
//!
//! Implements the upstream side of the pipeline:
//!
//! - **Messages**: wire types for trade events and control requests
//! - **Codec**: the trade normalizer
//! - **Client**: connection lifecycle, reconnect and heartbeat

pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod messages;
pub mod reconnect;

pub use client::{
    ConnectionState, DEFAULT_STREAM_URL, FeedState, IngestionClient, IngestionClientConfig,
    IngestionError, IngestionHandle,
};
pub use codec::{NormalizeError, TradeNormalizer, UpstreamEvent};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatMonitor};
pub use messages::{StreamMethod, StreamRequest, TradeEventMessage};
pub use reconnect::{Backoff, ReconnectConfig, ReconnectError, ReconnectPolicy};
