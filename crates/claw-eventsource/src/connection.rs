//! The streaming-connection capability consumed by the supervisor.
//!
//! The wire protocol lives outside this crate. A transport plugs in by
//! implementing [`Connector`], which opens [`Connection`] handles. Handles
//! report their [`ReadyState`] and dispatch "open", "error" and named
//! message events to registered listeners.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use url::Url;

use crate::state::ReadyState;

/// Event type dispatched when a handle opens.
pub const OPEN_EVENT: &str = "open";
/// Event type dispatched when a handle reports an error.
pub const ERROR_EVENT: &str = "error";
/// Event type of unnamed server messages.
pub const MESSAGE_EVENT: &str = "message";

/// A single event delivered by a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Event type name.
    pub event_type: String,
    /// Event payload.
    pub data: String,
    /// Last event ID reported by the server, if any.
    pub last_event_id: Option<String>,
}

impl MessageEvent {
    /// Create an event with no last event ID.
    pub fn new(event_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: data.into(),
            last_event_id: None,
        }
    }

    /// Attach a last event ID.
    #[must_use]
    pub fn with_last_event_id(mut self, id: impl Into<String>) -> Self {
        self.last_event_id = Some(id.into());
        self
    }
}

/// Identifies a listener registration on one handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Allocate a process-unique listener ID.
    #[must_use]
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Callback invoked for every event of the registered type.
pub type EventListener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Options passed to the transport when opening a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectOptions {
    /// Whether cross-origin credentials are sent.
    pub with_credentials: bool,
}

/// An open (or opening) streaming connection to one endpoint.
pub trait Connection: Send + Sync {
    /// URL this handle connects to.
    fn url(&self) -> &str;

    /// Current state of the handle.
    fn ready_state(&self) -> ReadyState;

    /// Register a listener for events of `event_type`.
    fn add_event_listener(&self, event_type: &str, listener: EventListener) -> ListenerId;

    /// Remove a listener. Once this returns the listener is not invoked again.
    fn remove_event_listener(&self, event_type: &str, id: ListenerId);

    /// Close the handle. Idempotent.
    fn close(&self);
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("url", &self.url())
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

/// Factory for [`Connection`] handles.
pub trait Connector: Send + Sync {
    /// Whether this environment can open streaming connections at all.
    fn is_supported(&self) -> bool {
        true
    }

    /// Open a new handle. The handle starts out connecting.
    fn open(&self, url: &str, options: &ConnectOptions) -> Arc<dyn Connection>;
}

/// Endpoint of an event source, accepted as a string or a parsed URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint(String);

impl Endpoint {
    /// String form of the endpoint.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<Url> for Endpoint {
    fn from(value: Url) -> Self {
        Self(value.into())
    }
}

impl From<&Url> for Endpoint {
    fn from(value: &Url) -> Self {
        Self(value.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_event_builder() {
        let event = MessageEvent::new("update", "{\"v\":1}").with_last_event_id("42");
        assert_eq!(event.event_type, "update");
        assert_eq!(event.data, "{\"v\":1}");
        assert_eq!(event.last_event_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_listener_ids_are_unique() {
        let a = ListenerId::next();
        let b = ListenerId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn test_endpoint_from_str_and_url() {
        let from_str = Endpoint::from("https://events.example.com/stream");
        assert_eq!(from_str.as_str(), "https://events.example.com/stream");

        let url = Url::parse("https://events.example.com/stream?topic=a").expect("valid url");
        let from_url = Endpoint::from(&url);
        assert_eq!(from_url.as_str(), "https://events.example.com/stream?topic=a");
        assert_eq!(Endpoint::from(url), from_url);
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint::from(String::from("http://localhost:8080/sse"));
        assert_eq!(endpoint.to_string(), "http://localhost:8080/sse");
    }

    #[test]
    fn test_connect_options_default() {
        assert!(!ConnectOptions::default().with_credentials);
    }
}
