//! Supervisor lifecycle events.

use std::time::Duration;

use crate::error::ConnectionError;

/// Transitions published by the connection supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A new handle is being opened.
    Connecting {
        /// Retry attempt this handle belongs to (0 for the first try).
        attempt: u32,
    },
    /// The handle reached the open state and is now live.
    Open,
    /// A live handle reported an error but may recover on its own.
    Interrupted,
    /// An attempt failed and a retry has been scheduled.
    Retrying {
        /// Retry attempt about to be made.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
        /// Failure that triggered the retry.
        error: ConnectionError,
    },
    /// The pipeline failed permanently.
    Failed(ConnectionError),
    /// The pipeline was shut down by `close()`.
    Closed,
}

