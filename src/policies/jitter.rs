//! # Jitter policy for restart delays.
//!
//! [`JitterPolicy`] adds randomness to restart delays so that the workers of one
//! pool, crashing together (shared bad deploy, shared dependency outage), do not
//! all come back at the same instant.
//!
//! - [`JitterPolicy::None`] no randomization, the documented formulas hold exactly
//! - [`JitterPolicy::Full`] random delay in [0, delay]
//! - [`JitterPolicy::Equal`] delay/2 + random[0, delay/2]

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Policy controlling randomization of restart delays.
///
/// ## Trade-offs
/// - **None**: predictable, but a whole pool restarts in lockstep
/// - **Full**: maximum spreading, may restart almost immediately
/// - **Equal**: keeps at least half of the computed delay
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterPolicy {
    /// No jitter: use the exact delay.
    #[default]
    None,

    /// Full jitter: random delay in [0, delay].
    Full,

    /// Equal jitter: delay/2 + random[0, delay/2].
    Equal,
}

impl JitterPolicy {
    /// Applies jitter to the given delay.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => full_jitter(delay),
            JitterPolicy::Equal => equal_jitter(delay),
        }
    }
}

fn full_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ms))
}

fn equal_jitter(delay: Duration) -> Duration {
    let ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
    let half = ms / 2;
    if half == 0 {
        return Duration::from_millis(ms);
    }
    Duration::from_millis(half + rand::rng().random_range(0..=half))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_identity() {
        let d = Duration::from_millis(1234);
        assert_eq!(JitterPolicy::None.apply(d), d);
    }

    #[test]
    fn test_full_and_equal_bounds() {
        let d = Duration::from_millis(1000);
        for _ in 0..200 {
            assert!(JitterPolicy::Full.apply(d) <= d);
            let eq = JitterPolicy::Equal.apply(d);
            assert!(eq >= Duration::from_millis(500) && eq <= d);
        }
        assert_eq!(JitterPolicy::Full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&JitterPolicy::Equal).unwrap();
        assert_eq!(json, "\"equal\"");
        let back: JitterPolicy = serde_json::from_str("\"full\"").unwrap();
        assert_eq!(back, JitterPolicy::Full);
    }
}
