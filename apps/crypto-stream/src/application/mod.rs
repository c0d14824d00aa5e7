//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and the storage port
//! that the ingestion pipeline and subscriber sessions are written against.

/// Port interfaces for external systems (trade store).
pub mod ports;

/// Application services for batch flushing and subscriber sessions.
pub mod services;
