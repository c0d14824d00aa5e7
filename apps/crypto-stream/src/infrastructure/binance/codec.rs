//! Trade Normalizer
//!
//! Turns one raw upstream text frame into a [`TradeRecord`] or a rejection.
//! Stateless; safe to share.
//!
//! Classification:
//! - not JSON, or not a JSON object: [`NormalizeError::MalformedPayload`]
//! - object without `"e": "trade"`: [`UpstreamEvent::Ignored`]
//! - trade with a missing or unconvertible field:
//!   [`NormalizeError::InvalidTradeFields`]
//!
//! Decimals are parsed from the wire strings, so the scale of the input is
//! kept exactly.

use std::str::FromStr;

use chrono::DateTime;
use rust_decimal::Decimal;
use serde_json::Value;

use super::messages::{TRADE_EVENT_TYPE, TradeEventMessage};
use crate::domain::trade::{NewTrade, Symbol, TradeRecord};

/// Normalizer errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    /// Payload is not a structured object.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A trade event with missing or invalid fields.
    #[error("invalid trade fields: {0}")]
    InvalidTradeFields(String),
}

/// A successfully classified upstream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// A normalized trade.
    Trade(TradeRecord),
    /// A well-formed message that is not a trade (subscription acks, other
    /// event types).
    Ignored {
        /// The `e` discriminator, if present.
        event_type: Option<String>,
    },
}

/// Upstream trade normalizer.
#[derive(Debug, Default, Clone, Copy)]
pub struct TradeNormalizer;

impl TradeNormalizer {
    /// Create a new normalizer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Classify and normalize one text frame.
    ///
    /// # Errors
    ///
    /// Returns [`NormalizeError`] for malformed payloads and trades with
    /// invalid fields.
    pub fn normalize(&self, text: &str) -> Result<UpstreamEvent, NormalizeError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;

        let mut event = match value {
            Value::Object(map) => map,
            other => {
                return Err(NormalizeError::MalformedPayload(format!(
                    "expected object, got {}",
                    json_kind(&other)
                )));
            }
        };

        // Combined-stream frames wrap the event.
        if event.contains_key("stream") {
            match event.remove("data") {
                Some(Value::Object(inner)) => event = inner,
                Some(_) => {
                    return Err(NormalizeError::MalformedPayload(
                        "stream envelope data is not an object".to_string(),
                    ));
                }
                None => {}
            }
        }

        let event_type = event.get("e").and_then(Value::as_str);
        if event_type != Some(TRADE_EVENT_TYPE) {
            return Ok(UpstreamEvent::Ignored {
                event_type: event_type.map(str::to_string),
            });
        }

        let message: TradeEventMessage = serde_json::from_value(Value::Object(event))
            .map_err(|e| NormalizeError::InvalidTradeFields(e.to_string()))?;

        to_record(message).map(UpstreamEvent::Trade)
    }
}

fn to_record(message: TradeEventMessage) -> Result<TradeRecord, NormalizeError> {
    let price = parse_decimal("price", &message.price)?;
    let quantity = message
        .quantity
        .as_deref()
        .map(|q| parse_decimal("quantity", q))
        .transpose()?;
    let timestamp = DateTime::from_timestamp_millis(message.trade_time).ok_or_else(|| {
        NormalizeError::InvalidTradeFields(format!(
            "trade time out of range: {}",
            message.trade_time
        ))
    })?;

    let trade = NewTrade {
        symbol: Symbol::new(&message.symbol),
        price,
        quantity,
        trade_id: message.trade_id,
        buyer_order_id: message.buyer_order_id,
        seller_order_id: message.seller_order_id,
        is_buyer_maker: message.is_buyer_maker.unwrap_or(false),
        timestamp,
    };

    TradeRecord::try_from(trade).map_err(|e| NormalizeError::InvalidTradeFields(e.to_string()))
}

fn parse_decimal(field: &str, raw: &str) -> Result<Decimal, NormalizeError> {
    Decimal::from_str(raw.trim())
        .map_err(|e| NormalizeError::InvalidTradeFields(format!("{field} {raw:?}: {e}")))
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use test_case::test_case;

    use super::*;

    fn normalize(text: &str) -> Result<UpstreamEvent, NormalizeError> {
        TradeNormalizer::new().normalize(text)
    }

    fn expect_trade(text: &str) -> TradeRecord {
        match normalize(text) {
            Ok(UpstreamEvent::Trade(record)) => record,
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn normalizes_full_trade() {
        let record = expect_trade(
            r#"{"e":"trade","E":1,"s":"BTCUSDT","t":12345,"p":"50000.00","q":"0.01","b":88,"a":50,"T":1700000000000,"m":true,"M":true}"#,
        );
        assert_eq!(record.symbol().as_str(), "btcusdt");
        assert_eq!(record.price().to_string(), "50000.00");
        assert_eq!(record.quantity().unwrap().to_string(), "0.01");
        assert_eq!(record.trade_id(), Some(12345));
        assert_eq!(record.buyer_order_id(), Some(88));
        assert_eq!(record.seller_order_id(), Some(50));
        assert!(record.is_buyer_maker());
        assert_eq!(record.timestamp().timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn unwraps_combined_stream_envelope() {
        let record = expect_trade(
            r#"{"stream":"ethusdt@trade","data":{"e":"trade","s":"ETHUSDT","p":"3000.5","T":1}}"#,
        );
        assert_eq!(record.symbol().as_str(), "ethusdt");
        assert_eq!(record.quantity(), None);
        assert!(!record.is_buyer_maker());
    }

    #[test_case(r#"{"result":null,"id":1}"#, None ; "subscription ack")]
    #[test_case(r#"{"e":"aggTrade","s":"BTCUSDT"}"#, Some("aggTrade") ; "other event type")]
    #[test_case(r#"{"e":5}"#, None ; "non string discriminator")]
    fn non_trade_ignored(text: &str, event_type: Option<&str>) {
        assert_eq!(
            normalize(text),
            Ok(UpstreamEvent::Ignored {
                event_type: event_type.map(str::to_string)
            })
        );
    }

    #[test_case("not json" ; "garbage")]
    #[test_case("[1,2,3]" ; "array")]
    #[test_case("\"trade\"" ; "string")]
    #[test_case(r#"{"stream":"x","data":[1]}"# ; "envelope data not object")]
    fn malformed_rejected(text: &str) {
        assert!(matches!(
            normalize(text),
            Err(NormalizeError::MalformedPayload(_))
        ));
    }

    #[test_case(r#"{"e":"trade","p":"1","T":1}"# ; "missing symbol")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","T":1}"# ; "missing price")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":"1"}"# ; "missing trade time")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":"abc","T":1}"# ; "non numeric price")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":"1","q":"x","T":1}"# ; "non numeric quantity")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":"-1","T":1}"# ; "negative price")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":"0.123456789","T":1}"# ; "too precise")]
    #[test_case(r#"{"e":"trade","s":"","p":"1","T":1}"# ; "empty symbol")]
    #[test_case(r#"{"e":"trade","s":"BTCUSDT","p":1.5,"T":1}"# ; "numeric price")]
    fn invalid_fields_rejected(text: &str) {
        assert!(matches!(
            normalize(text),
            Err(NormalizeError::InvalidTradeFields(_))
        ));
    }

    proptest! {
        #[test]
        fn decimals_round_trip_exactly(
            int_part in 0u64..10_000_000,
            frac in 0u64..100_000_000,
            scale in 0u32..=8,
            symbol in "[A-Za-z]{3,10}",
        ) {
            let frac = frac % 10u64.pow(scale);
            let price = if scale == 0 {
                int_part.to_string()
            } else {
                format!("{int_part}.{frac:0width$}", width = scale as usize)
            };
            let text = format!(
                r#"{{"e":"trade","s":"{symbol}","p":"{price}","q":"{price}","T":1}}"#
            );

            let Ok(UpstreamEvent::Trade(record)) = normalize(&text) else {
                return Err(TestCaseError::fail("expected trade"));
            };
            prop_assert_eq!(record.price().to_string(), price.clone());
            prop_assert_eq!(record.quantity().map(|q| q.to_string()), Some(price));
            prop_assert_eq!(record.symbol().as_str(), symbol.to_lowercase());
        }
    }
}
