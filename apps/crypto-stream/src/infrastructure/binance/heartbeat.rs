//! Heartbeat Monitor
//!
//! Detects a silent upstream connection. The receive loop records every
//! inbound frame as activity; on each tick the monitor either asks for a
//! ping or, if nothing arrived within the timeout, reports the connection
//! dead so the client can reconnect.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::UpstreamSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between liveness checks (and pings).
    pub ping_interval: Duration,
    /// Silence longer than this is treated as a dead connection.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub const fn from_upstream_settings(settings: &UpstreamSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            idle_timeout: settings.heartbeat_timeout,
        }
    }
}

/// Outcome of a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Connection looks alive; send a ping.
    SendPing,
    /// Nothing received for longer than the idle timeout.
    Timeout(Duration),
}

/// Per-connection liveness tracker.
///
/// Owned by the receive loop and polled from its `select!`.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
    ticker: Interval,
}

impl HeartbeatMonitor {
    /// Start monitoring; the first tick fires one interval from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let mut ticker = tokio::time::interval_at(now + config.ping_interval, config.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            last_activity: now,
            ticker,
        }
    }

    /// Record that a frame was received.
    pub fn record_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last received frame.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Wait for the next tick and judge the connection.
    pub async fn tick(&mut self) -> HeartbeatEvent {
        self.ticker.tick().await;
        let idle = self.idle_for();
        if idle > self.config.idle_timeout {
            tracing::warn!(
                idle_secs = idle.as_secs(),
                timeout_secs = self.config.idle_timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            HeartbeatEvent::Timeout(idle)
        } else {
            HeartbeatEvent::SendPing
        }
    }
}
