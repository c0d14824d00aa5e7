//! Reconnection Policy
//!
//! Decides how long the ingestion client waits before reconnecting after a
//! transport failure. The default is a fixed 5 second delay retried forever;
//! an exponential schedule with a cap and optional jitter can be injected
//! through configuration.

use std::time::Duration;

use rand::Rng;

use crate::UpstreamSettings;

/// Default delay between reconnection attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Delay schedule before jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every attempt.
    Fixed(Duration),
    /// `initial * multiplier^n`, capped at `max`.
    Exponential {
        /// Delay before the first attempt.
        initial: Duration,
        /// Upper bound on any delay.
        max: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
}

impl Backoff {
    /// Build a schedule from raw settings. A multiplier of 1.0 or less gives
    /// a fixed delay.
    #[must_use]
    pub fn from_parts(initial: Duration, max: Duration, multiplier: f64) -> Self {
        if multiplier > 1.0 {
            Self::Exponential {
                initial,
                max: max.max(initial),
                multiplier,
            }
        } else {
            Self::Fixed(initial)
        }
    }

    const fn initial(&self) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { initial, .. } => *initial,
        }
    }

    fn after(&self, current: Duration) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential {
                max, multiplier, ..
            } => {
                #[allow(clippy::cast_precision_loss)]
                let (scaled, cap) = (
                    (current.as_millis() as f64 * multiplier).round(),
                    max.as_millis() as f64,
                );
                if !scaled.is_finite() || scaled < 0.0 || scaled >= cap {
                    return max;
                }
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let millis = scaled as u64;
                Duration::from_millis(millis)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectConfig {
    /// Delay schedule.
    pub backoff: Backoff,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of consecutive attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    /// Fixed delay, no jitter, unlimited attempts.
    #[must_use]
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            backoff: Backoff::Fixed(delay),
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub fn from_upstream_settings(settings: &UpstreamSettings) -> Self {
        Self {
            backoff: Backoff::from_parts(
                settings.reconnect_delay_initial,
                settings.reconnect_delay_max,
                settings.reconnect_delay_multiplier,
            ),
            jitter_factor: settings.reconnect_jitter.clamp(0.0, 1.0),
            max_attempts: settings.max_reconnect_attempts,
        }
    }
}

/// Stateful reconnection schedule.
///
/// # Example
///
/// ```rust
/// use crypto_stream::infrastructure::binance::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// assert_eq!(policy.next_delay(), Some(Duration::from_secs(5)));
///
/// // After a successful connection
/// policy.reset();
/// assert_eq!(policy.attempt_count(), 0);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    current_delay: Duration,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            current_delay: config.backoff.initial(),
            config,
            attempt_count: 0,
        }
    }

    /// Delay before the next attempt, or `None` once the attempt limit is
    /// reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempt_count += 1;

        let delay = self.apply_jitter(self.current_delay);
        self.current_delay = self.config.backoff.after(self.current_delay);
        Some(delay)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.backoff.initial();
        self.attempt_count = 0;
    }

    /// Consecutive attempts since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Policy configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base = duration.as_millis() as f64;
        let range = base * self.config.jitter_factor;
        let jitter: f64 = rand::rng().random_range(-range..=range);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis = (base + jitter).round().max(1.0) as u64;
        Duration::from_millis(millis)
    }
}

/// Error type for reconnection failures.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// Maximum reconnection attempts exceeded.
    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxAttemptsExceeded(u32),
}
