//! Reconnect backoff
//!
//! `delay(n) = min(max_delay, initial_delay * multiplier^n)` plus a random
//! jitter of up to `jitter_ratio` of that capped value. The attempt counter
//! grows on every failure and resets on success.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "millis")]
    pub initial_delay: Duration,
    #[serde(with = "millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the capped delay added as random jitter (0 disables)
    pub jitter_ratio: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_ratio: 0.5,
        }
    }
}

/// Attempt counter plus policy
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Failed attempts since the last success
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Capped delay for `attempt`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial = self.config.initial_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = initial * self.config.multiplier.powi(exponent);
        let max = self.config.max_delay.as_secs_f64();

        if raw.is_finite() && raw < max {
            Duration::from_secs_f64(raw.max(0.0))
        } else {
            self.config.max_delay
        }
    }

    /// Delay for the next attempt; advances the counter
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let spread = base.as_secs_f64() * self.config.jitter_ratio.max(0.0);
        if !spread.is_finite() || spread <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rand::thread_rng().gen_range(0.0..=spread))
    }

    /// Back to the initial delay
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// `Duration` as integer milliseconds
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_delay_doubles_then_caps() {
        let backoff = ReconnectBackoff::default();
        let secs: Vec<u64> = (0..7).map(|n| backoff.base_delay(n).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.base_delay(500), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let mut backoff = ReconnectBackoff::default();
        for attempt in 0..8 {
            let base = backoff.base_delay(attempt);
            let delay = backoff.next_delay();
            assert!(delay >= base);
            assert!(delay <= base + base / 2);
        }
        assert_eq!(backoff.attempt(), 8);
    }

    #[test]
    fn test_reset_returns_to_initial_delay() {
        let mut backoff = ReconnectBackoff::new(BackoffConfig {
            jitter_ratio: 0.0,
            ..BackoffConfig::default()
        });
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_negative_multiplier_never_goes_below_zero() {
        let mut backoff = ReconnectBackoff::new(BackoffConfig {
            multiplier: -2.0,
            jitter_ratio: f64::NAN,
            ..BackoffConfig::default()
        });
        assert_eq!(backoff.base_delay(1), Duration::ZERO);
        assert_eq!(backoff.base_delay(2), Duration::from_secs(4));

        backoff.next_delay();
        assert_eq!(backoff.next_delay(), Duration::ZERO);
    }

    #[test]
    fn test_config_reads_millis() {
        let config: BackoffConfig =
            serde_json::from_str(r#"{"initial_delay": 250, "max_delay": 4000}"#).unwrap();
        assert_eq!(config.initial_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, Duration::from_secs(4));
        assert_eq!(config.multiplier, 2.0);
    }
}
