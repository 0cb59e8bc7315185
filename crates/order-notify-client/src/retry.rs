/*
[INPUT]:  Reconnection settings and consecutive failure notifications
[OUTPUT]: Capped exponential backoff delays, or exhaustion
[POS]:    Connection layer - reconnection pacing
[UPDATE]: When changing backoff shape or attempt accounting
*/

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Bounded, capped-backoff reconnection policy.
///
/// The transport drop that starts a reconnection cycle is the first failure;
/// each failed reconnect attempt adds one more. `next_delay` returns `None`
/// once `max_attempts` reconnect attempts have been spent.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt_count: u32,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Reconnect attempts scheduled since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempt_count
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Forget previous failures; called on every successful connect
    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Schedule the next reconnect attempt, or `None` when exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt_count >= self.config.max_attempts {
            return None;
        }
        self.attempt_count += 1;
        Some(self.apply_jitter(self.backoff(self.attempt_count)))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let delay = self
            .config
            .base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.config.max_delay);
        delay.min(self.config.max_delay)
    }

    fn apply_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.config.jitter;
        if jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        // Saturate instead of panicking when the scaled delay leaves Duration's range.
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter: 0.0,
        })
    }

    #[rstest]
    #[case(1, Duration::from_secs(1))]
    #[case(2, Duration::from_secs(2))]
    #[case(3, Duration::from_secs(4))]
    #[case(4, Duration::from_secs(5))]
    #[case(5, Duration::from_secs(5))]
    fn backoff_doubles_and_clamps(#[case] attempt: u32, #[case] expected: Duration) {
        let mut policy = policy(5);
        let mut delay = None;
        for _ in 0..attempt {
            delay = policy.next_delay();
        }
        assert_eq!(delay, Some(expected));
        assert_eq!(policy.attempts(), attempt);
    }

    #[test]
    fn exhausts_after_max_attempts() {
        let mut policy = policy(5);
        for _ in 0..5 {
            assert!(policy.next_delay().is_some());
        }
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 5);
    }

    #[test]
    fn reset_restarts_from_zero() {
        let mut policy = policy(2);
        policy.next_delay();
        policy.next_delay();
        assert_eq!(policy.next_delay(), None);

        policy.reset();
        assert_eq!(policy.attempts(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn zero_attempt_policy_never_retries() {
        let mut policy = policy(0);
        assert_eq!(policy.next_delay(), None);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut policy = RetryPolicy::new(RetryConfig {
            max_attempts: 50,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            jitter: 0.5,
        });
        let first = policy.next_delay().unwrap();
        assert!(first >= Duration::from_millis(500));
        assert!(first <= Duration::from_millis(1500));
        for _ in 0..40 {
            let delay = policy.next_delay().unwrap();
            assert!(delay <= Duration::from_millis(5000));
        }
    }

    #[test]
    fn jitter_saturates_at_duration_limit() {
        let mut policy = RetryPolicy::new(RetryConfig {
            max_attempts: 20,
            base_delay: Duration::MAX,
            max_delay: Duration::MAX,
            jitter: 1.0,
        });
        for _ in 0..20 {
            let delay = policy.next_delay().unwrap();
            assert!(delay <= Duration::MAX);
        }
        assert_eq!(policy.next_delay(), None);
    }
}
