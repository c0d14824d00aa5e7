//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `BatchFlusher`: Moves buffered trades into the trade store on a timer
//! - `SubscriptionSession`: One live subscriber's membership and requests

/// Periodic batch flushing.
pub mod flush;

/// Subscriber sessions and the delivery protocol.
pub mod session;

pub use flush::{BatchFlusher, DEFAULT_FLUSH_INTERVAL};
pub use session::{
    ClientRequest, DEFAULT_HISTORY_LIMIT, HistoryEntry, LiveFeed, PricePayload, ServerMessage,
    SessionError, SubscriptionSession,
};
