//! Persistence Adapters
//!
//! Implementations of the `TradeStore` port.

pub mod in_memory;

pub use in_memory::InMemoryTradeStore;
