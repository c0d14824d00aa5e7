//! Domain Layer - Core trade types and buffering.
//!
//! This layer contains the canonical trade representation and the
//! in-memory batch that holds trades until they are persisted. Nothing
//! here performs I/O.

/// Symbols and normalized trade records.
pub mod trade;

/// Per-symbol accumulation of trades awaiting flush.
pub mod batch;
