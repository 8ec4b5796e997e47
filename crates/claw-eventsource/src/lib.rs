//! # claw-eventsource
//!
//! Reconnecting, multiplexed client for server-pushed event streams.
//!
//! This crate provides:
//!
//! - [`EventSource`]: One supervised connection fanned out to per-type event streams
//! - [`RetryPolicy`]: Retry budget, backoff bounds and connection timeout
//! - [`Supervisor`]: Retry loop with full-jitter exponential backoff
//! - [`StateTracker`]: Queryable connection state plus its change stream
//! - [`ReplayCell`] / [`EventStream`]: Multicast with a one-value replay buffer
//! - [`Connection`] / [`Connector`]: The transport seam
//! - [`MockConnector`]: In-memory transport for tests
//!
//! ## Example
//!
//! ```rust,no_run
//! use claw_eventsource::{EventSource, MockConnector, RetryPolicy};
//! use futures::StreamExt;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let connector = MockConnector::auto_open();
//! let source = EventSource::new("https://events.example.com/stream")
//!     .with_policy(RetryPolicy::default().with_max_retries(5))
//!     .with_connector(connector);
//!
//! let mut updates = source.on("update");
//! if let Some(Ok(event)) = updates.next().await {
//!     println!("{}: {}", event.event_type, event.data);
//! }
//!
//! source.close();
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod mock;
mod multiplexer;
pub mod replay;
pub mod source;
pub mod state;
pub mod supervisor;

// Re-export main types
pub use backoff::{backoff_ceiling, full_jitter};
pub use config::RetryPolicy;
pub use connection::{
    ConnectOptions, Connection, Connector, Endpoint, EventListener, ListenerId, MessageEvent,
    ERROR_EVENT, MESSAGE_EVENT, OPEN_EVENT,
};
pub use error::{ConfigError, ConnectionError, ListenerError};
pub use events::LifecycleEvent;
pub use mock::{MockConnection, MockConnector};
pub use replay::{EventStream, ReplayCell};
pub use source::EventSource;
pub use state::{AtomicReadyState, ReadyState, StateTracker};
pub use supervisor::Supervisor;
