//! Configuration Module
//!
//! Configuration loading for the crypto stream service.

mod settings;

pub use settings::{
    BroadcastSettings, BufferSettings, ConfigError, DEFAULT_SYMBOLS, ServerSettings,
    StreamConfig, UpstreamSettings, parse_symbols,
};
