//! Dispatch client configuration.
//!
//! Built in code with the `with_*` builder methods, or read from the
//! environment with [`ClientConfig::from_env`]:
//!
//! | Variable | Field | Default |
//! |----------|-------|---------|
//! | `DISPATCH_COMPUTE_ADDR` | `server_addr` | `localhost:45042` |
//! | `DISPATCH_REQUEST_CAPACITY` | `request_capacity` | 64 |
//! | `DISPATCH_OBSERVER_CAPACITY` | `observer_capacity` | 256 |
//! | `DISPATCH_OVERFLOW_WAIT_MS` | `overflow` (`Wait` when set) | `Evict` |
//! | `DISPATCH_STALL_TIMEOUT_SECS` | `stall_timeout` | none |
//! | `DISPATCH_PENDING_WARNING` | `pending_warning_threshold` | 100 |
//! | `DISPATCH_CONNECT_RETRIES` | `connect_retry.max_retries` | 3 |

use crate::retry::RetryPolicy;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable held an unparsable value
    #[error("Invalid value for {var}: {value}")]
    InvalidVar {
        /// Variable name
        var: &'static str,
        /// Raw value
        value: String,
    },

    /// A setting is out of range
    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

/// What the forwarding routine does when an observer's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the observer immediately and complete it with `Evicted`.
    Evict,
    /// Wait up to the given duration for space, then evict.
    ///
    /// Observers are served one after another, so a stuck observer delays the
    /// others by at most this long per event.
    Wait(Duration),
}

/// Configuration for a [`DispatchClient`](crate::DispatchClient).
///
/// # Example
///
/// ```
/// use solution_dispatch_runtime::config::{ClientConfig, OverflowPolicy};
/// use std::time::Duration;
///
/// let config = ClientConfig::new("compute:45042")
///     .with_observer_capacity(1024)
///     .with_overflow(OverflowPolicy::Wait(Duration::from_millis(50)))
///     .with_stall_timeout(Some(Duration::from_secs(3600)));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Address of the compute service
    pub server_addr: String,
    /// Queue size between the service stream and the forwarding routine
    pub request_capacity: usize,
    /// Queue size of each observer's result and error channels
    pub observer_capacity: usize,
    /// Behaviour when an observer's queue is full
    pub overflow: OverflowPolicy,
    /// Abandon a request after this long without any event
    ///
    /// `None` keeps a silent request pending until its producer finishes or is
    /// dropped.
    pub stall_timeout: Option<Duration>,
    /// Pending-request count above which health reports degraded
    pub pending_warning_threshold: usize,
    /// Backoff for establishing the connection
    pub connect_retry: RetryPolicy,
}

impl ClientConfig {
    /// Default configuration for the given service address.
    #[must_use]
    pub fn new(server_addr: impl Into<String>) -> Self {
        Self {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }

    /// Read configuration from `DISPATCH_*` environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if a variable is unparsable or the result does
    /// not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// # Errors
    ///
    /// Same as [`ClientConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("DISPATCH_COMPUTE_ADDR") {
            config.server_addr = addr;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "DISPATCH_REQUEST_CAPACITY")? {
            config.request_capacity = capacity;
        }
        if let Some(capacity) = parse_var::<usize>(&lookup, "DISPATCH_OBSERVER_CAPACITY")? {
            config.observer_capacity = capacity;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "DISPATCH_OVERFLOW_WAIT_MS")? {
            config.overflow = OverflowPolicy::Wait(Duration::from_millis(ms));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "DISPATCH_STALL_TIMEOUT_SECS")? {
            config.stall_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(threshold) = parse_var::<usize>(&lookup, "DISPATCH_PENDING_WARNING")? {
            config.pending_warning_threshold = threshold;
        }
        if let Some(retries) = parse_var::<usize>(&lookup, "DISPATCH_CONNECT_RETRIES")? {
            config.connect_retry.max_retries = retries;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the request channel capacity.
    #[must_use]
    pub const fn with_request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity;
        self
    }

    /// Set the per-observer channel capacity.
    #[must_use]
    pub const fn with_observer_capacity(mut self, capacity: usize) -> Self {
        self.observer_capacity = capacity;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub const fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set or clear the stall timeout.
    #[must_use]
    pub const fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Set the pending-request warning threshold.
    #[must_use]
    pub const fn with_pending_warning_threshold(mut self, threshold: usize) -> Self {
        self.pending_warning_threshold = threshold;
        self
    }

    /// Set the connection retry policy.
    #[must_use]
    pub fn with_connect_retry(mut self, policy: RetryPolicy) -> Self {
        self.connect_retry = policy;
        self
    }

    /// Check that every setting is usable.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] describing the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_addr.trim().is_empty() {
            return Err(ConfigError::Validation(
                "server_addr cannot be empty".to_string(),
            ));
        }
        if self.request_capacity == 0 {
            return Err(ConfigError::Validation(
                "request_capacity must be > 0".to_string(),
            ));
        }
        if self.observer_capacity == 0 {
            return Err(ConfigError::Validation(
                "observer_capacity must be > 0".to_string(),
            ));
        }
        if matches!(self.overflow, OverflowPolicy::Wait(wait) if wait.is_zero()) {
            return Err(ConfigError::Validation(
                "overflow wait must be > 0; use Evict instead".to_string(),
            ));
        }
        if self.stall_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConfigError::Validation(
                "stall_timeout must be > 0 when set".to_string(),
            ));
        }
        if self.connect_retry.multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "connect_retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_addr: "localhost:45042".to_string(),
            request_capacity: 64,
            observer_capacity: 256,
            overflow: OverflowPolicy::Evict,
            stall_timeout: None,
            pending_warning_threshold: 100,
            connect_retry: RetryPolicy::builder().jitter(true).build(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidVar { var, value })
        })
        .transpose()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_validate() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overflow, OverflowPolicy::Evict);
        assert!(config.stall_timeout.is_none());
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = ClientConfig::from_lookup(lookup(&[
            ("DISPATCH_COMPUTE_ADDR", "ta2:45042"),
            ("DISPATCH_OBSERVER_CAPACITY", "8"),
            ("DISPATCH_OVERFLOW_WAIT_MS", "25"),
            ("DISPATCH_STALL_TIMEOUT_SECS", "60"),
            ("DISPATCH_CONNECT_RETRIES", "0"),
        ]))
        .unwrap();

        assert_eq!(config.server_addr, "ta2:45042");
        assert_eq!(config.observer_capacity, 8);
        assert_eq!(
            config.overflow,
            OverflowPolicy::Wait(Duration::from_millis(25))
        );
        assert_eq!(config.stall_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.connect_retry.max_retries, 0);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = ClientConfig::from_lookup(lookup(&[("DISPATCH_OBSERVER_CAPACITY", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidVar {
                var: "DISPATCH_OBSERVER_CAPACITY",
                value: "lots".to_string(),
            }
        );
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = ClientConfig::default().with_observer_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Validation(_))
        ));

        let config = ClientConfig::default().with_overflow(OverflowPolicy::Wait(Duration::ZERO));
        assert!(config.validate().is_err());

        let config = ClientConfig::default().with_stall_timeout(Some(Duration::ZERO));
        assert!(config.validate().is_err());
    }
}
