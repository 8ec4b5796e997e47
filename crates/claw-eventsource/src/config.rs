//! Retry policy configuration.
//!
//! The policy controls how the supervisor retries a failed connection:
//! - how many retries are allowed before the pipeline fails terminally
//! - the base and ceiling of the full-jitter exponential backoff
//! - how long a single attempt may wait for the open signal
//! - whether the transport sends credentials
//!
//! Policies can be built in code or loaded from JSON, where durations are
//! given in milliseconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default number of retries before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Default base delay for the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(1_000);
/// Default ceiling for any retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_millis(10_000);
/// Default time allowed for a handle to open.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_millis(15_000);

/// Retry and connection settings for an event source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Number of retries allowed before the pipeline fails terminally.
    pub max_retries: u32,
    /// Base delay; retry `n` waits at most `initial_delay * 2^n`.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any retry delay.
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Time a handle may spend connecting before the attempt times out.
    #[serde(rename = "connection_timeout_ms", with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Whether the transport should send credentials.
    pub with_credentials: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            with_credentials: false,
        }
    }
}

impl RetryPolicy {
    /// Set the maximum number of retries.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base backoff delay.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set the backoff ceiling.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the per-attempt connection timeout.
    #[must_use]
    pub const fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set whether credentials are sent.
    #[must_use]
    pub const fn with_credentials(mut self, with_credentials: bool) -> Self {
        self.with_credentials = with_credentials;
        self
    }

    /// Check if another retry is allowed after `attempt` retries.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// Load a policy from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }

    /// Parse a policy from a JSON string. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or the policy fails validation.
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let policy: Self = serde_json::from_str(content)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Validate the policy.
    ///
    /// # Errors
    ///
    /// Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::Invalid(format!(
                "initial_delay ({}ms) exceeds max_delay ({}ms)",
                self.initial_delay.as_millis(),
                self.max_delay.as_millis()
            )));
        }

        if self.connection_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "connection_timeout must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(1_000));
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
        assert_eq!(policy.connection_timeout, Duration::from_millis(15_000));
        assert!(!policy.with_credentials);
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let policy = RetryPolicy::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(2))
            .with_connection_timeout(Duration::from_millis(50))
            .with_credentials(true);

        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
        assert_eq!(policy.connection_timeout, Duration::from_millis(50));
        assert!(policy.with_credentials);
    }

    #[test]
    fn test_should_retry() {
        let policy = RetryPolicy::default().with_max_retries(2);
        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let never = RetryPolicy::default().with_max_retries(0);
        assert!(!never.should_retry(0));
    }

    #[test]
    fn test_from_json_partial_uses_defaults() {
        let policy = RetryPolicy::from_json(r#"{"max_retries": 7, "connection_timeout_ms": 50}"#)
            .expect("valid policy");

        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.connection_timeout, Duration::from_millis(50));
        assert_eq!(policy.initial_delay, DEFAULT_INITIAL_DELAY);
        assert_eq!(policy.max_delay, DEFAULT_MAX_DELAY);
    }

    #[test]
    fn test_json_uses_millisecond_fields() {
        let policy = RetryPolicy::default().with_initial_delay(Duration::from_millis(250));
        let json = serde_json::to_value(&policy).expect("serialize");

        assert_eq!(json["initial_delay_ms"], 250);
        assert_eq!(json["max_delay_ms"], 10_000);
        assert_eq!(json["connection_timeout_ms"], 15_000);
        assert_eq!(json["with_credentials"], false);
    }

    #[test]
    fn test_from_json_rejects_inverted_delays() {
        let err = RetryPolicy::from_json(r#"{"initial_delay_ms": 5000, "max_delay_ms": 100}"#)
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert!(err.to_string().contains("exceeds max_delay"));
    }

    #[test]
    fn test_from_json_rejects_zero_timeout() {
        let err = RetryPolicy::from_json(r#"{"connection_timeout_ms": 0}"#).expect_err("must fail");
        assert!(err.to_string().contains("connection_timeout"));
    }

    #[test]
    fn test_from_json_invalid_syntax() {
        let err = RetryPolicy::from_json("{not json").expect_err("must fail");
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"max_retries": 1, "with_credentials": true}}"#).expect("write");

        let policy = RetryPolicy::from_file(file.path()).expect("load");
        assert_eq!(policy.max_retries, 1);
        assert!(policy.with_credentials);
    }

    #[test]
    fn test_from_file_missing() {
        let err = RetryPolicy::from_file("/nonexistent/eventsource.json").expect_err("must fail");
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
