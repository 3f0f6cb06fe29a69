//! Engine configuration.
//!
//! [`EngineConfig`] is threaded explicitly into the scheduler; nothing is
//! read from process-wide state after construction. [`EngineConfig::from_env`]
//! layers `KEEL_*` environment variables over the defaults:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `KEEL_MAX_CONCURRENCY` | `max_concurrency` |
//! | `KEEL_RETRY_MAX_ATTEMPTS` | `retry.max_attempts` |
//! | `KEEL_RETRY_BASE_DELAY_MS` | `retry.base_delay` |
//! | `KEEL_RETRY_MAX_DELAY_MS` | `retry.max_delay` |
//! | `KEEL_RETRY_JITTER_MS` | `retry.jitter` |
//! | `KEEL_GATE_POLL_INTERVAL_SECS` | `default_gate.poll_interval` |
//! | `KEEL_GATE_DEADLINE_SECS` | `default_gate.deadline` |

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gate::GateSpec;
use crate::retry::RetryPolicy;

/// Default number of node operations in flight.
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Maximum node operations running at once.
    pub max_concurrency: usize,
    /// Retry policy for provider calls.
    pub retry: RetryPolicy,
    /// Gate spec used when a gated node declares none.
    pub default_gate: GateSpec,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            retry: RetryPolicy::default(),
            default_gate: GateSpec::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from `KEEL_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is malformed or the result
    /// fails validation.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`EngineConfig::from_env`], reading variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is malformed or the result
    /// fails validation.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup };
        let mut config = Self::default();

        if let Some(n) = env.u64("KEEL_MAX_CONCURRENCY")? {
            config.max_concurrency = usize::try_from(n)
                .map_err(|_| Error::config("KEEL_MAX_CONCURRENCY is too large"))?;
        }
        if let Some(n) = env.u64("KEEL_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = u32::try_from(n)
                .map_err(|_| Error::config("KEEL_RETRY_MAX_ATTEMPTS is too large"))?;
        }
        if let Some(ms) = env.u64("KEEL_RETRY_BASE_DELAY_MS")? {
            config.retry.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("KEEL_RETRY_MAX_DELAY_MS")? {
            config.retry.max_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = env.u64("KEEL_RETRY_JITTER_MS")? {
            config.retry.jitter = Duration::from_millis(ms);
        }
        if let Some(secs) = env.u64("KEEL_GATE_POLL_INTERVAL_SECS")? {
            config.default_gate.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env.u64("KEEL_GATE_DEADLINE_SECS")? {
            config.default_gate.deadline = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks invariants between fields.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first violated invariant,
    /// or [`Error::InvalidGate`] for the default gate.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(Error::config("max_concurrency must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::config("retry.max_attempts must be at least 1"));
        }
        if self.retry.base_delay > self.retry.max_delay {
            return Err(Error::config(format!(
                "retry.base_delay ({:?}) exceeds retry.max_delay ({:?})",
                self.retry.base_delay, self.retry.max_delay
            )));
        }
        self.default_gate.validate("default")?;
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn u64(&self, name: &str) -> Result<Option<u64>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<u64>()
            .map(Some)
            .map_err(|e| Error::config(format!("{name} must be a u64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn env_overrides_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("KEEL_MAX_CONCURRENCY", "2"),
            ("KEEL_RETRY_MAX_ATTEMPTS", " 3 "),
            ("KEEL_RETRY_JITTER_MS", "0"),
            ("KEEL_GATE_POLL_INTERVAL_SECS", "5"),
            ("KEEL_GATE_DEADLINE_SECS", "60"),
        ]))
        .unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.jitter, Duration::ZERO);
        assert_eq!(config.default_gate.poll_interval, Duration::from_secs(5));
        assert_eq!(config.default_gate.deadline, Duration::from_secs(60));
    }

    #[test]
    fn blank_values_are_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[("KEEL_MAX_CONCURRENCY", "  ")])).unwrap();
        assert_eq!(config.max_concurrency, DEFAULT_MAX_CONCURRENCY);
    }

    #[test]
    fn malformed_values_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[("KEEL_MAX_CONCURRENCY", "many")])).unwrap_err();
        assert!(err.to_string().contains("KEEL_MAX_CONCURRENCY"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(EngineConfig::from_lookup(lookup(&[("KEEL_MAX_CONCURRENCY", "0")])).is_err());
    }

    #[test]
    fn deadline_shorter_than_interval_rejected() {
        let err = EngineConfig::from_lookup(lookup(&[
            ("KEEL_GATE_POLL_INTERVAL_SECS", "30"),
            ("KEEL_GATE_DEADLINE_SECS", "10"),
        ]))
        .unwrap_err();
        assert!(matches!(err, Error::InvalidGate { ref owner, .. } if owner == "default"));
    }
}
