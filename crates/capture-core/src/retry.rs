//! ============================================================================
//! Retry Policy - Exponential Backoff with Jitter for Queued Submissions
//! ============================================================================
//! Decides when a queue entry that hit a transient failure may be attempted
//! again, and when it has exhausted its attempts and must wait for an
//! operator:
//! - Exponential backoff from a base delay, capped at a max delay
//! - Optional jitter (0-50% on top of the capped delay)
//! - Bounded attempt count; after the bound the entry is failed, never dropped
//! ============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for queue retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Maximum number of submission attempts before the entry is failed
    pub max_attempts: u32,
    /// Base delay between retries (will be multiplied by 2^attempt)
    pub base_delay_ms: u64,
    /// Maximum delay between retries
    pub max_delay_ms: u64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 2_000,
            max_delay_ms: 900_000,
            jitter: true,
        }
    }
}

/// What to do with an entry after a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again no earlier than this instant
    RetryAt(DateTime<Utc>),
    /// Attempt bound reached; hold for operator intervention
    GiveUp,
}

/// Calculate delay with exponential backoff and optional jitter
pub fn calculate_delay(attempt: u32, config: &RetryConfig) -> Duration {
    let multiplier = 2u64.saturating_pow(attempt.min(63));
    let base_delay = config.base_delay_ms.saturating_mul(multiplier);
    let capped_delay = base_delay.min(config.max_delay_ms);

    let final_delay = if config.jitter {
        let jitter_factor = 1.0 + rand::random::<f64>() * 0.5;
        (capped_delay as f64 * jitter_factor) as u64
    } else {
        capped_delay
    };

    Duration::from_millis(final_delay)
}

/// Decide the next step for an entry that has now failed `attempts` times
pub fn decide(attempts: u32, config: &RetryConfig, now: DateTime<Utc>) -> RetryDecision {
    if attempts >= config.max_attempts {
        return RetryDecision::GiveUp;
    }

    let delay = calculate_delay(attempts.saturating_sub(1), config);
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
    RetryDecision::RetryAt(now + delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig {
            jitter: false,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            ..Default::default()
        };

        assert_eq!(calculate_delay(0, &config), Duration::from_millis(500));
        assert_eq!(calculate_delay(1, &config), Duration::from_millis(1000));
        assert_eq!(calculate_delay(2, &config), Duration::from_millis(2000));
        assert_eq!(calculate_delay(3, &config), Duration::from_millis(4000));
        assert_eq!(calculate_delay(4, &config), Duration::from_millis(8000));
        assert_eq!(calculate_delay(10, &config), Duration::from_millis(10_000));
    }

    #[test]
    fn test_calculate_delay_with_jitter() {
        let config = RetryConfig {
            jitter: true,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            ..Default::default()
        };

        for _ in 0..20 {
            let delay = calculate_delay(0, &config);
            assert!(delay >= Duration::from_millis(1000));
            assert!(delay <= Duration::from_millis(1500));
        }
    }

    #[test]
    fn test_calculate_delay_does_not_overflow() {
        let config = RetryConfig {
            jitter: false,
            base_delay_ms: u64::MAX / 2,
            max_delay_ms: 5000,
            ..Default::default()
        };

        assert_eq!(calculate_delay(200, &config), Duration::from_millis(5000));
    }

    #[test]
    fn test_decide_schedules_backoff_until_bound() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            jitter: false,
        };
        let now = Utc::now();

        assert_eq!(
            decide(1, &config, now),
            RetryDecision::RetryAt(now + chrono::Duration::milliseconds(1000))
        );
        assert_eq!(
            decide(2, &config, now),
            RetryDecision::RetryAt(now + chrono::Duration::milliseconds(2000))
        );
        assert_eq!(decide(3, &config, now), RetryDecision::GiveUp);
        assert_eq!(decide(9, &config, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 8);
        assert_eq!(config.base_delay_ms, 2_000);
        assert_eq!(config.max_delay_ms, 900_000);
        assert!(config.jitter);
    }
}
