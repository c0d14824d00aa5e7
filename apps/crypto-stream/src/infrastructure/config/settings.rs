//! Service Configuration Settings
//!
//! Configuration types for the crypto stream service, loaded from environment
//! variables. Unparseable numeric values fall back to their defaults; an
//! empty symbol list or an unknown overflow policy is an error.

use std::time::Duration;

use crate::domain::batch::{BufferLimit, OverflowPolicy};
use crate::domain::trade::Symbol;

/// Symbols followed when `CRYPTO_PAIRS` is unset.
pub const DEFAULT_SYMBOLS: &str = "btcusdt,ethusdt,bnbusdt,solusdt,xrpusdt";

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// Upstream WebSocket URL.
    pub url: String,
    /// Heartbeat ping interval.
    pub heartbeat_interval: Duration,
    /// Silence longer than this closes the connection.
    pub heartbeat_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Backoff multiplier; `1.0` keeps the delay fixed.
    pub reconnect_delay_multiplier: f64,
    /// Random jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: "wss://stream.binance.com:9443/ws".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(60),
            reconnect_delay_initial: Duration::from_secs(5),
            reconnect_delay_max: Duration::from_secs(60),
            reconnect_delay_multiplier: 1.0,
            reconnect_jitter: 0.0,
            max_reconnect_attempts: 0, // Unlimited
        }
    }
}

/// Batch buffer and flush settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSettings {
    /// Interval between flushes.
    pub flush_interval: Duration,
    /// Maximum buffered records (`None` = unbounded).
    pub max_records: Option<usize>,
    /// What to do when `max_records` is reached.
    pub overflow: OverflowPolicy,
}

impl Default for BufferSettings {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(10),
            max_records: None,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl BufferSettings {
    /// Buffer limit, if one is configured.
    #[must_use]
    pub fn limit(&self) -> Option<BufferLimit> {
        self.max_records.map(|max_records| BufferLimit {
            max_records,
            policy: self.overflow,
        })
    }
}

/// Fan-out settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastSettings {
    /// Delivery queue depth per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Subscriber WebSocket port.
    pub ws_port: u16,
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_port: 8000,
            health_port: 8082,
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Symbols to ingest, lower-cased and deduplicated.
    pub symbols: Vec<Symbol>,
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
    /// Buffer and flush settings.
    pub buffer: BufferSettings,
    /// Fan-out settings.
    pub broadcast: BroadcastSettings,
    /// Server port settings.
    pub server: ServerSettings,
}

impl StreamConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if no symbols are configured or a value cannot be
    /// interpreted.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// See [`StreamConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let pairs = lookup("CRYPTO_PAIRS").unwrap_or_else(|| DEFAULT_SYMBOLS.to_string());
        let symbols = parse_symbols(&pairs);
        if symbols.is_empty() {
            return Err(ConfigError::NoSymbols);
        }

        let upstream_defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            url: lookup("BINANCE_WEBSOCKET_URI")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(upstream_defaults.url),
            heartbeat_interval: parse_duration_secs(
                &lookup,
                "STREAM_HEARTBEAT_INTERVAL_SECS",
                upstream_defaults.heartbeat_interval,
            ),
            heartbeat_timeout: parse_duration_secs(
                &lookup,
                "STREAM_HEARTBEAT_TIMEOUT_SECS",
                upstream_defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: parse_duration_millis(
                &lookup,
                "STREAM_RECONNECT_DELAY_INITIAL_MS",
                upstream_defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_duration_secs(
                &lookup,
                "STREAM_RECONNECT_DELAY_MAX_SECS",
                upstream_defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_or(
                &lookup,
                "STREAM_RECONNECT_DELAY_MULTIPLIER",
                upstream_defaults.reconnect_delay_multiplier,
            ),
            reconnect_jitter: parse_or(
                &lookup,
                "STREAM_RECONNECT_JITTER",
                upstream_defaults.reconnect_jitter,
            ),
            max_reconnect_attempts: parse_or(
                &lookup,
                "STREAM_MAX_RECONNECT_ATTEMPTS",
                upstream_defaults.max_reconnect_attempts,
            ),
        };

        let overflow = match lookup("STREAM_BUFFER_OVERFLOW") {
            Some(raw) => OverflowPolicy::from_str_case_insensitive(&raw).ok_or_else(|| {
                ConfigError::InvalidValue {
                    key: "STREAM_BUFFER_OVERFLOW".to_string(),
                    value: raw,
                }
            })?,
            None => OverflowPolicy::default(),
        };

        let buffer = BufferSettings {
            flush_interval: parse_duration_secs(
                &lookup,
                "DATA_SAVE_INTERVAL_SECS",
                BufferSettings::default().flush_interval,
            ),
            max_records: lookup("STREAM_BUFFER_MAX_RECORDS")
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|&n| n > 0),
            overflow,
        };

        let broadcast = BroadcastSettings {
            subscriber_capacity: parse_or(
                &lookup,
                "STREAM_SUBSCRIBER_CAPACITY",
                BroadcastSettings::default().subscriber_capacity,
            )
            .max(1),
        };

        let server = ServerSettings {
            ws_port: parse_or(&lookup, "STREAM_WS_PORT", ServerSettings::default().ws_port),
            health_port: parse_or(
                &lookup,
                "STREAM_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        Ok(Self {
            symbols,
            upstream,
            buffer,
            broadcast,
            server,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The symbol list is empty.
    #[error("no symbols configured (CRYPTO_PAIRS is empty)")]
    NoSymbols,
    /// A value could not be interpreted.
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

/// Parse a comma-separated symbol list, dropping blanks and duplicates while
/// keeping first-seen order.
#[must_use]
pub fn parse_symbols(raw: &str) -> Vec<Symbol> {
    let mut symbols: Vec<Symbol> = Vec::new();
    for symbol in raw.split(',').map(Symbol::new) {
        if !symbol.is_empty() && !symbols.contains(&symbol) {
            symbols.push(symbol);
        }
    }
    symbols
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Zero is treated as unset: every seconds-valued key drives a timer period.
fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|&secs| secs > 0)
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}
