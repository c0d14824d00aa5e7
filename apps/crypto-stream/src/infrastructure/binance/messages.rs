//! Binance WebSocket Message Types
//!
//! Wire format types for the Binance spot trade stream. Field names map to
//! Binance's single-letter JSON keys.
//!
//! # Message Types
//!
//! ## Inbound
//! - `TradeEventMessage`: one executed trade (`"e": "trade"`)
//!
//! ## Outbound
//! - `StreamRequest`: `SUBSCRIBE` / `UNSUBSCRIBE` control request
//!
//! # References
//!
//! - [Trade Streams](https://developers.binance.com/docs/binance-spot-api-docs/web-socket-streams#trade-streams)

use serde::{Deserialize, Serialize};

use crate::domain::trade::Symbol;

/// Event type discriminator carried by trade events.
pub const TRADE_EVENT_TYPE: &str = "trade";

// =============================================================================
// Inbound Messages
// =============================================================================

/// Raw trade event.
///
/// ```json
/// {"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001",
///  "q":"100","b":88,"a":50,"T":1672515782136,"m":true,"M":true}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeEventMessage {
    /// Event type, always `trade`.
    #[serde(rename = "e")]
    pub event_type: String,
    /// Event time (ms epoch).
    #[serde(rename = "E", default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<i64>,
    /// Symbol, upper-case on the wire.
    #[serde(rename = "s")]
    pub symbol: String,
    /// Trade ID.
    #[serde(rename = "t", default)]
    pub trade_id: Option<i64>,
    /// Price as a decimal string.
    #[serde(rename = "p")]
    pub price: String,
    /// Quantity as a decimal string.
    #[serde(rename = "q", default)]
    pub quantity: Option<String>,
    /// Buyer order ID.
    #[serde(rename = "b", default, skip_serializing_if = "Option::is_none")]
    pub buyer_order_id: Option<i64>,
    /// Seller order ID.
    #[serde(rename = "a", default, skip_serializing_if = "Option::is_none")]
    pub seller_order_id: Option<i64>,
    /// Trade time (ms epoch).
    #[serde(rename = "T")]
    pub trade_time: i64,
    /// Whether the buyer was the maker.
    #[serde(rename = "m", default)]
    pub is_buyer_maker: Option<bool>,
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Control request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StreamMethod {
    /// Start receiving streams.
    Subscribe,
    /// Stop receiving streams.
    Unsubscribe,
}

/// Control request sent over the live connection.
///
/// ```json
/// {"method":"SUBSCRIBE","params":["btcusdt@trade","ethusdt@trade"],"id":1}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamRequest {
    /// Method.
    pub method: StreamMethod,
    /// Stream names.
    pub params: Vec<String>,
    /// Request ID echoed in the response.
    pub id: u64,
}

impl StreamRequest {
    /// Subscribe to the trade stream of every symbol in one request.
    #[must_use]
    pub fn subscribe_trades(symbols: &[Symbol], id: u64) -> Self {
        Self {
            method: StreamMethod::Subscribe,
            params: symbols.iter().map(Symbol::trade_stream).collect(),
            id,
        }
    }

    /// Unsubscribe from the trade stream of every symbol.
    #[must_use]
    pub fn unsubscribe_trades(symbols: &[Symbol], id: u64) -> Self {
        Self {
            method: StreamMethod::Unsubscribe,
            params: symbols.iter().map(Symbol::trade_stream).collect(),
            id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trade_event_deserializes() {
        let json = r#"{"e":"trade","E":1672515782136,"s":"BNBBTC","t":12345,"p":"0.001","q":"100","b":88,"a":50,"T":1672515782136,"m":true,"M":true}"#;
        let msg: TradeEventMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.event_type, "trade");
        assert_eq!(msg.symbol, "BNBBTC");
        assert_eq!(msg.trade_id, Some(12345));
        assert_eq!(msg.price, "0.001");
        assert_eq!(msg.quantity.as_deref(), Some("100"));
        assert_eq!(msg.buyer_order_id, Some(88));
        assert_eq!(msg.seller_order_id, Some(50));
        assert_eq!(msg.trade_time, 1_672_515_782_136);
        assert_eq!(msg.is_buyer_maker, Some(true));
    }

    #[test]
    fn trade_event_optional_fields_absent() {
        let json = r#"{"e":"trade","s":"BTCUSDT","p":"1.0","T":1}"#;
        let msg: TradeEventMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.quantity, None);
        assert_eq!(msg.buyer_order_id, None);
        assert_eq!(msg.is_buyer_maker, None);
    }

    #[test]
    fn subscribe_request_serializes() {
        let symbols = [Symbol::new("btcusdt"), Symbol::new("ETHUSDT")];
        let json = serde_json::to_string(&StreamRequest::subscribe_trades(&symbols, 1)).unwrap();
        assert_eq!(
            json,
            r#"{"method":"SUBSCRIBE","params":["btcusdt@trade","ethusdt@trade"],"id":1}"#
        );
    }

    #[test]
    fn unsubscribe_request_method() {
        let req = StreamRequest::unsubscribe_trades(&[Symbol::new("btcusdt")], 2);
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["method"], "UNSUBSCRIBE");
    }
}
