//! # Backoff policy for worker restarts.
//!
//! [`BackoffPolicy`] maps a consecutive failure count to a restart delay:
//!
//! ```text
//! delay(n) = min(first × factor^(n-1), max)      n = consecutive failures, n >= 1
//! ```
//!
//! `n = 0` is treated like `n = 1`. Jitter is applied to the clamped base and never
//! fed back, so each delay is derived from the failure count alone.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use workvisor::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::exponential(Duration::from_millis(100), Duration::from_secs(5));
//!
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(10), Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Restart backoff policy.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`1.0` = fixed delay).
    pub factor: f64,
    /// Jitter applied on top of the computed delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns the interactive defaults: `first = 100ms`, `max = 5s`, `factor = 2.0`.
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), Duration::from_secs(5))
    }
}

impl BackoffPolicy {
    /// Doubling backoff from `first`, capped at `max`.
    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Constant delay.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
            jitter: JitterPolicy::None,
        }
    }

    /// Returns a copy with the given jitter.
    pub fn with_jitter(mut self, jitter: JitterPolicy) -> Self {
        self.jitter = jitter;
        self
    }

    /// Computes the delay after `consecutive_failures` failures.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let exp = consecutive_failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let max_secs = self.max.as_secs_f64();
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_failure_uses_first() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
    }

    #[test]
    fn test_exponential_growth_no_jitter() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(6), Duration::from_millis(3200));
        assert_eq!(policy.delay(7), Duration::from_millis(5000));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let policy = BackoffPolicy::default();
        let mut prev = Duration::ZERO;
        for n in 0..200 {
            let d = policy.delay(n);
            assert!(d >= prev, "delay({n}) = {d:?} < {prev:?}");
            assert!(d <= policy.max);
            prev = d;
        }
        assert_eq!(policy.delay(u32::MAX), policy.max);
    }

    #[test]
    fn test_fixed_is_constant() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(1));
        for n in 0..10 {
            assert_eq!(policy.delay(n), Duration::from_secs(1));
        }
    }

    #[test]
    fn test_first_exceeds_max() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(10), Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
    }

    #[test]
    fn test_equal_jitter_keeps_half() {
        let policy = BackoffPolicy::default().with_jitter(JitterPolicy::Equal);
        for n in 1..10 {
            let base = BackoffPolicy::default().delay(n);
            let d = policy.delay(n);
            assert!(d >= base / 2 && d <= base, "n={n}: {d:?} vs {base:?}");
        }
    }
}
