//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the supervision runtime.
//!
//! Config is used in three ways:
//! 1. **Policy selection**: [`Config::error_policy`] picks the interactive or unattended policy
//! 2. **Worker timeouts**: [`Config::worker_settings`] feeds every [`ManagedWorker`](crate::ManagedWorker)
//! 3. **Runtime wiring**: `Supervisor::builder(config)` sizes the event bus and shutdown grace
//!
//! ## Sentinel values
//! - `bus_capacity = 0` → clamped to 1
//! - `grace = 0s` → stop without waiting

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::policies::{ErrorPolicy, InteractivePolicy, JitterPolicy, UnattendedPolicy};

/// How the runtime reacts to failures.
///
/// - `Development`: a human is watching; park broken workers and wait for a fix.
/// - `Production`: nobody is watching; restart a few times, then exit and let
///   the process manager take over.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeMode {
    /// Interactive mode (hot reload, wait for fixes).
    Development,
    /// Unattended mode (default).
    #[default]
    Production,
}

/// Global configuration for the supervision runtime.
///
/// ## Field semantics
/// - `mode`: selects the error policy
/// - `startup_timeout`: max wait for a worker's `ready` message
/// - `stop_timeout`: max wait for a worker to exit after `stop` before force termination
/// - `stability_window`: ready time after which a crash is treated as isolated
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `grace`: max wait for the server to stop after an OS signal
/// - `restart_jitter`: randomization applied to restart delays
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Failure handling mode.
    pub mode: RuntimeMode,

    /// Maximum time a worker may take to report `ready`.
    #[serde(with = "duration_ms")]
    pub startup_timeout: Duration,

    /// Maximum time a worker may take to exit gracefully.
    #[serde(with = "duration_ms")]
    pub stop_timeout: Duration,

    /// Ready time after which the consecutive failure count restarts at 1.
    ///
    /// Only honoured by policies that opt into it (see [`ErrorPolicy::stability_window`]).
    #[serde(with = "duration_ms")]
    pub stability_window: Duration,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Maximum time to wait for graceful server shutdown.
    #[serde(with = "duration_ms")]
    pub grace: Duration,

    /// Jitter applied on top of policy restart delays.
    pub restart_jitter: JitterPolicy,
}

impl Config {
    /// Returns the error policy matching [`Config::mode`].
    pub fn error_policy(&self) -> Arc<dyn ErrorPolicy> {
        match self.mode {
            RuntimeMode::Development => Arc::new(
                InteractivePolicy::default()
                    .with_stability_window(self.stability_window)
                    .with_jitter(self.restart_jitter),
            ),
            RuntimeMode::Production => {
                Arc::new(UnattendedPolicy::default().with_jitter(self.restart_jitter))
            }
        }
    }

    /// Returns the per-worker timing settings.
    #[inline]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            startup_timeout: self.startup_timeout,
            stop_timeout: self.stop_timeout,
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `mode = Production`
    /// - `startup_timeout = 15s`
    /// - `stop_timeout = 10s`
    /// - `stability_window = 30s`
    /// - `bus_capacity = 1024`
    /// - `grace = 60s`
    /// - `restart_jitter = None`
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            startup_timeout: Duration::from_secs(15),
            stop_timeout: Duration::from_secs(10),
            stability_window: Duration::from_secs(30),
            bus_capacity: 1024,
            grace: Duration::from_secs(60),
            restart_jitter: JitterPolicy::None,
        }
    }
}

/// Timing settings applied to one managed worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Maximum wait for `ready`.
    pub startup_timeout: Duration,
    /// Maximum wait for a graceful exit.
    pub stop_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Config::default().worker_settings()
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis().min(u128::from(u64::MAX)) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = Config::default();
        assert_eq!(cfg.startup_timeout, Duration::from_secs(15));
        assert_eq!(cfg.stop_timeout, Duration::from_secs(10));
        assert_eq!(cfg.stability_window, Duration::from_secs(30));
        assert_eq!(cfg.mode, RuntimeMode::Production);
    }

    #[test]
    fn test_policy_follows_mode() {
        let mut cfg = Config::default();
        assert!(!cfg.error_policy().allow_degraded_mode());

        cfg.mode = RuntimeMode::Development;
        let policy = cfg.error_policy();
        assert!(policy.allow_degraded_mode());
        assert_eq!(policy.stability_window(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"mode":"development","startup_timeout":500}"#).unwrap();
        assert_eq!(cfg.mode, RuntimeMode::Development);
        assert_eq!(cfg.startup_timeout, Duration::from_millis(500));
        assert_eq!(cfg.bus_capacity, 1024);
    }
}
