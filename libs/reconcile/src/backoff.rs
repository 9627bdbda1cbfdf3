//! Exponential backoff for per-key requeues.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay for the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
            jitter: 0.0,
        }
    }
}

impl BackoffPolicy {
    /// Create a policy without jitter.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate the delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        // Clamp the exponent; anything past 2^32 is capped by `max` anyway.
        let exp = attempt.min(32) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            let range = delay * self.jitter.min(1.0);
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        let final_delay = (delay + jitter).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(final_delay as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = BackoffPolicy::new(Duration::from_millis(5), Duration::from_secs(1000));

        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(1), Duration::from_millis(10));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(10), Duration::from_millis(5120));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        };

        for _ in 0..100 {
            let d = policy.delay(1);
            assert!(d >= Duration::from_millis(150));
            assert!(d <= Duration::from_millis(250));
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_delay_monotonic_and_capped(
            base_ms in 1u64..1_000,
            max_secs in 1u64..2_000,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_secs(max_secs),
            );

            let current = policy.delay(attempt);
            let next = policy.delay(attempt + 1);

            proptest::prop_assert!(current <= next);
            proptest::prop_assert!(next <= policy.max);
        }
    }
}
