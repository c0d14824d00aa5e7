//! Trade Domain Types
//!
//! `Symbol` and `TradeRecord` are the two immutable values that flow through
//! the whole pipeline: the normalizer produces them, the batch buffer holds
//! them, the broker fans them out and the store appends them.
//!
//! # Invariants
//!
//! - A `Symbol` is always trimmed and lower-cased, so routing by symbol is
//!   case-insensitive.
//! - A `TradeRecord` can only be built through [`TradeRecord::try_from`],
//!   which rejects negative decimals and decimals with more than
//!   [`MAX_FRACTIONAL_DIGITS`] fractional digits.

use std::borrow::Borrow;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Maximum number of fractional digits kept for prices and quantities.
pub const MAX_FRACTIONAL_DIGITS: u32 = 8;

// =============================================================================
// Symbol
// =============================================================================

/// Case-normalized identifier for a tradable pair (e.g. `btcusdt`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String")]
pub struct Symbol(String);

impl Symbol {
    /// Create a symbol, trimming whitespace and lower-casing it.
    #[must_use]
    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_lowercase())
    }

    /// Get the symbol as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether the symbol is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Name of the upstream trade stream for this symbol (`btcusdt@trade`).
    #[must_use]
    pub fn trade_stream(&self) -> String {
        format!("{}@trade", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for Symbol {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

impl From<&str> for Symbol {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl AsRef<str> for Symbol {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// =============================================================================
// Trade Record
// =============================================================================

/// Field values for a trade that has not been validated yet.
#[derive(Debug, Clone)]
pub struct NewTrade {
    /// Pair the trade belongs to.
    pub symbol: Symbol,
    /// Execution price.
    pub price: Decimal,
    /// Executed quantity, if the upstream reported one.
    pub quantity: Option<Decimal>,
    /// Upstream trade ID.
    pub trade_id: Option<i64>,
    /// Upstream buyer order ID.
    pub buyer_order_id: Option<i64>,
    /// Upstream seller order ID.
    pub seller_order_id: Option<i64>,
    /// Whether the buyer was the maker.
    pub is_buyer_maker: bool,
    /// Trade time reported by the upstream.
    pub timestamp: DateTime<Utc>,
}

impl NewTrade {
    /// Start a trade with only the required fields set.
    #[must_use]
    pub const fn new(symbol: Symbol, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            quantity: None,
            trade_id: None,
            buyer_order_id: None,
            seller_order_id: None,
            is_buyer_maker: false,
            timestamp,
        }
    }
}

/// Reason a trade was refused by [`TradeRecord::try_from`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TradeFieldError {
    /// Symbol was empty after normalization.
    #[error("symbol is empty")]
    EmptySymbol,

    /// A decimal field was negative.
    #[error("{field} is negative: {value}")]
    Negative {
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },

    /// A decimal field carried too many fractional digits.
    #[error("{field} has {scale} fractional digits (max {MAX_FRACTIONAL_DIGITS})")]
    TooPrecise {
        /// Field name.
        field: &'static str,
        /// Scale of the offending value.
        scale: u32,
    },
}

/// One normalized trade event, immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRecord {
    symbol: Symbol,
    price: Decimal,
    quantity: Option<Decimal>,
    trade_id: Option<i64>,
    buyer_order_id: Option<i64>,
    seller_order_id: Option<i64>,
    is_buyer_maker: bool,
    timestamp: DateTime<Utc>,
}

impl TryFrom<NewTrade> for TradeRecord {
    type Error = TradeFieldError;

    fn try_from(trade: NewTrade) -> Result<Self, Self::Error> {
        if trade.symbol.is_empty() {
            return Err(TradeFieldError::EmptySymbol);
        }
        check_decimal("price", trade.price)?;
        if let Some(quantity) = trade.quantity {
            check_decimal("quantity", quantity)?;
        }

        Ok(Self {
            symbol: trade.symbol,
            price: trade.price,
            quantity: trade.quantity,
            trade_id: trade.trade_id,
            buyer_order_id: trade.buyer_order_id,
            seller_order_id: trade.seller_order_id,
            is_buyer_maker: trade.is_buyer_maker,
            timestamp: trade.timestamp,
        })
    }
}

impl TradeRecord {
    /// Pair the trade belongs to.
    #[must_use]
    pub const fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    /// Execution price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Executed quantity.
    #[must_use]
    pub const fn quantity(&self) -> Option<Decimal> {
        self.quantity
    }

    /// Upstream trade ID.
    #[must_use]
    pub const fn trade_id(&self) -> Option<i64> {
        self.trade_id
    }

    /// Upstream buyer order ID.
    #[must_use]
    pub const fn buyer_order_id(&self) -> Option<i64> {
        self.buyer_order_id
    }

    /// Upstream seller order ID.
    #[must_use]
    pub const fn seller_order_id(&self) -> Option<i64> {
        self.seller_order_id
    }

    /// Whether the buyer was the maker.
    #[must_use]
    pub const fn is_buyer_maker(&self) -> bool {
        self.is_buyer_maker
    }

    /// Upstream trade time.
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn check_decimal(field: &'static str, value: Decimal) -> Result<(), TradeFieldError> {
    if value.is_sign_negative() && !value.is_zero() {
        return Err(TradeFieldError::Negative { field, value });
    }
    if value.scale() > MAX_FRACTIONAL_DIGITS {
        return Err(TradeFieldError::TooPrecise {
            field,
            scale: value.scale(),
        });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
