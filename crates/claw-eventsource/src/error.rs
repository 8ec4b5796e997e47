//! Error types for claw-eventsource.

use std::time::Duration;

use thiserror::Error;

/// Failures of the connection pipeline.
///
/// Cloneable so a single terminal failure can be handed to every subscriber
/// of every event channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The host has no streaming-connection capability.
    #[error("event streams are not supported in this environment")]
    Unsupported,

    /// The handle errored before it reached the open state, or the
    /// transport closed it for good after opening.
    #[error("connection dropped by the transport (attempt {attempt})")]
    Dropped {
        /// Retry attempt during which the connection dropped.
        attempt: u32,
    },

    /// No open signal arrived within the connection timeout.
    #[error("connection timed out after {}ms", timeout.as_millis())]
    Timeout {
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Retries are exhausted; the pipeline is permanently failed.
    #[error("connection unrecoverable after {attempt} retries: {message}")]
    Unrecoverable {
        /// Number of retries performed before giving up.
        attempt: u32,
        /// Message of the failure that exhausted the retries.
        message: String,
    },
}

impl ConnectionError {
    /// Returns true if the pipeline will not recover from this error.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Unsupported | Self::Unrecoverable { .. })
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A policy value is out of range.
    #[error("invalid retry policy: {0}")]
    Invalid(String),

    /// The configuration file could not be read.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A raw listener could not forward an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    /// The transport delivered an event of a different type than the
    /// listener was registered for.
    #[error("listener for '{expected}' received '{actual}' event")]
    UnexpectedType {
        /// Type the listener was registered for.
        expected: String,
        /// Type carried by the inbound event.
        actual: String,
    },

    /// The channel behind the listener no longer accepts events.
    #[error("event channel '{0}' is closed")]
    ChannelClosed(String),
}
