//! In-memory transport for tests.
//!
//! [`MockConnector`] hands out [`MockConnection`] handles that never touch
//! the network. Tests drive them explicitly: open them, raise errors, and
//! emit named events.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::connection::{
    ConnectOptions, Connection, Connector, EventListener, ListenerId, MessageEvent, ERROR_EVENT,
    OPEN_EVENT,
};
use crate::state::{AtomicReadyState, ReadyState};

/// A scripted connection handle.
pub struct MockConnection {
    url: String,
    options: ConnectOptions,
    state: AtomicReadyState,
    closed_by_client: AtomicBool,
    listeners: Mutex<HashMap<String, Vec<(ListenerId, EventListener)>>>,
}

impl MockConnection {
    /// Create a handle in the connecting state.
    #[must_use]
    pub fn new(url: impl Into<String>, options: ConnectOptions) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            options,
            state: AtomicReadyState::new(ReadyState::Connecting),
            closed_by_client: AtomicBool::new(false),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Options the handle was opened with.
    #[must_use]
    pub const fn options(&self) -> ConnectOptions {
        self.options
    }

    /// Move to `Open` and dispatch the open signal.
    pub fn open(&self) {
        self.state.store(ReadyState::Open);
        self.dispatch(OPEN_EVENT, &MessageEvent::new(OPEN_EVENT, ""));
    }

    /// Dispatch an error signal without changing state.
    pub fn raise_error(&self) {
        self.dispatch(ERROR_EVENT, &MessageEvent::new(ERROR_EVENT, ""));
    }

    /// Move to `Connecting` and dispatch an error, like a transport that
    /// is reconnecting on its own.
    pub fn interrupt(&self) {
        self.state.store(ReadyState::Connecting);
        self.raise_error();
    }

    /// Move to `Closed` and dispatch an error, like a transport that gave up.
    pub fn close_with_error(&self) {
        self.state.store(ReadyState::Closed);
        self.raise_error();
    }

    /// Dispatch a message of `event_type` with `data`.
    pub fn emit(&self, event_type: &str, data: &str) {
        self.dispatch(event_type, &MessageEvent::new(event_type, data));
    }

    /// Invoke the listeners registered for `listener_type` with `event`.
    /// No-op once the client has closed the handle.
    pub fn dispatch(&self, listener_type: &str, event: &MessageEvent) {
        if self.closed_by_client.load(Ordering::SeqCst) {
            return;
        }

        let listeners: Vec<EventListener> = self
            .listeners
            .lock()
            .get(listener_type)
            .map(|entries| entries.iter().map(|(_, l)| Arc::clone(l)).collect())
            .unwrap_or_default();

        for listener in listeners {
            listener(event);
        }
    }

    /// Number of listeners registered for `event_type`.
    #[must_use]
    pub fn listener_count(&self, event_type: &str) -> usize {
        self.listeners.lock().get(event_type).map_or(0, Vec::len)
    }

    /// Wait until exactly `count` listeners are registered for `event_type`.
    pub async fn wait_for_listeners(&self, event_type: &str, count: usize) {
        while self.listener_count(event_type) != count {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Returns true if the handle is closed, by the client or the transport.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst) || self.state.load() == ReadyState::Closed
    }

    /// Returns true if the client called `close()`.
    #[must_use]
    pub fn was_closed_by_client(&self) -> bool {
        self.closed_by_client.load(Ordering::SeqCst)
    }
}

impl Connection for MockConnection {
    fn url(&self) -> &str {
        &self.url
    }

    fn ready_state(&self) -> ReadyState {
        self.state.load()
    }

    fn add_event_listener(&self, event_type: &str, listener: EventListener) -> ListenerId {
        let id = ListenerId::next();
        self.listeners
            .lock()
            .entry(event_type.to_string())
            .or_default()
            .push((id, listener));
        id
    }

    fn remove_event_listener(&self, event_type: &str, id: ListenerId) {
        if let Some(entries) = self.listeners.lock().get_mut(event_type) {
            entries.retain(|(existing, _)| *existing != id);
        }
    }

    fn close(&self) {
        self.closed_by_client.store(true, Ordering::SeqCst);
        self.state.store(ReadyState::Closed);
    }
}

/// Connector producing [`MockConnection`] handles.
pub struct MockConnector {
    supported: bool,
    auto_open: bool,
    opened: Mutex<Vec<Arc<MockConnection>>>,
    handles_tx: mpsc::UnboundedSender<Arc<MockConnection>>,
    handles_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<MockConnection>>>,
    open_count: AtomicUsize,
}

impl MockConnector {
    fn build(supported: bool, auto_open: bool) -> Arc<Self> {
        let (handles_tx, handles_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            supported,
            auto_open,
            opened: Mutex::new(Vec::new()),
            handles_tx,
            handles_rx: tokio::sync::Mutex::new(handles_rx),
            open_count: AtomicUsize::new(0),
        })
    }

    /// Connector whose handles stay connecting until a test opens them.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Self::build(true, false)
    }

    /// Connector whose handles are already open when returned.
    #[must_use]
    pub fn auto_open() -> Arc<Self> {
        Self::build(true, true)
    }

    /// Connector reporting that streaming is unavailable.
    #[must_use]
    pub fn unsupported() -> Arc<Self> {
        Self::build(false, false)
    }

    /// Wait for the next handle the supervisor opens.
    pub async fn next_handle(&self) -> Option<Arc<MockConnection>> {
        self.handles_rx.lock().await.recv().await
    }

    /// Every handle opened so far, oldest first.
    #[must_use]
    pub fn handles(&self) -> Vec<Arc<MockConnection>> {
        self.opened.lock().clone()
    }

    /// Number of handles opened so far.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }
}

impl Connector for MockConnector {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn open(&self, url: &str, options: &ConnectOptions) -> Arc<dyn Connection> {
        let handle = MockConnection::new(url, *options);
        if self.auto_open {
            handle.open();
        }

        self.open_count.fetch_add(1, Ordering::SeqCst);
        self.opened.lock().push(Arc::clone(&handle));
        let _ = self.handles_tx.send(Arc::clone(&handle));
        handle
    }
}
