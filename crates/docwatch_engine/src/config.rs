//! Configuration for the watch engine.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`WatchEngine`](crate::WatchEngine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Reconnect backoff.
    pub backoff: BackoffConfig,
    /// How many existence filter resets in a row a target may go through
    /// before it is failed.
    pub max_consecutive_resets: u32,
}

impl WatchConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            max_consecutive_resets: 3,
        }
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets the reset threshold.
    pub fn with_max_consecutive_resets(mut self, resets: u32) -> Self {
        self.max_consecutive_resets = resets;
        self
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded exponential backoff with jitter for stream reconnects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Fraction of the delay added or subtracted at random, in `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl BackoffConfig {
    /// Creates a backoff configuration.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 1.5,
            jitter_factor: 0.5,
        }
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the jitter factor.
    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before reconnect attempt `attempt` (0-indexed).
    ///
    /// Attempt 0 reconnects immediately. Later attempts wait
    /// `initial_delay * multiplier^(attempt - 1)`, capped at `max_delay`,
    /// then jittered by up to `jitter_factor` in either direction.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64()).max(0.0);

        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter.is_nan() || jitter == 0.0 {
            return Duration::from_secs_f64(capped);
        }
        let spread = capped * jitter;
        let delay = rand::thread_rng().gen_range((capped - spread)..=(capped + spread));
        Duration::from_secs_f64(delay.clamp(0.0, self.max_delay.as_secs_f64()))
    }

    /// Delay used after the server reports resource exhaustion.
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
