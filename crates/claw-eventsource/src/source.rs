//! The public event source: supervisor, multiplexer and state tracker
//! behind one handle, torn down together by [`EventSource::close`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::RetryPolicy;
use crate::connection::{Connection, Connector, Endpoint, MessageEvent, MESSAGE_EVENT};
use crate::error::ConnectionError;
use crate::events::LifecycleEvent;
use crate::multiplexer::Multiplexer;
use crate::replay::EventStream;
use crate::state::{ReadyState, StateTracker};
use crate::supervisor::Supervisor;

/// A reconnecting, multiplexed server-sent event source.
///
/// Nothing connects until the first call to [`EventSource::on`] (or
/// [`EventSource::connection_stream`]). From then on one supervised
/// connection feeds every event channel, across reconnects.
///
/// Must be used from within a tokio runtime. Dropping the source closes it.
pub struct EventSource {
    endpoint: Endpoint,
    policy: RetryPolicy,
    connector: Option<Arc<dyn Connector>>,
    runtime: Runtime,
    closed: AtomicBool,
}

/// Components sharing one cancellation token.
struct Runtime {
    state: Arc<StateTracker>,
    supervisor: Supervisor,
    multiplexer: Multiplexer,
    cancel: CancellationToken,
}

impl Runtime {
    fn new(endpoint: &Endpoint, policy: &RetryPolicy, connector: Option<Arc<dyn Connector>>) -> Self {
        let cancel = CancellationToken::new();
        let state = Arc::new(StateTracker::new());
        let supervisor = Supervisor::new(
            endpoint.clone(),
            policy.clone(),
            connector,
            Arc::clone(&state),
            cancel.clone(),
        );

        Self {
            state,
            supervisor,
            multiplexer: Multiplexer::new(cancel.clone()),
            cancel,
        }
    }
}

impl EventSource {
    /// Create an event source for `endpoint` with the default policy and no
    /// transport. Without a connector every subscription fails with
    /// [`ConnectionError::Unsupported`].
    #[must_use]
    pub fn new(endpoint: impl Into<Endpoint>) -> Self {
        let endpoint = endpoint.into();
        let policy = RetryPolicy::default();
        let runtime = Runtime::new(&endpoint, &policy, None);

        Self {
            endpoint,
            policy,
            connector: None,
            runtime,
            closed: AtomicBool::new(false),
        }
    }

    /// Use `policy` for retries and the connection timeout.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self.runtime = Runtime::new(&self.endpoint, &self.policy, self.connector.clone());
        self
    }

    /// Use `connector` to open connection handles.
    #[must_use]
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self.runtime = Runtime::new(&self.endpoint, &self.policy, self.connector.clone());
        self
    }

    fn runtime(&self) -> Option<&Runtime> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        Some(&self.runtime)
    }

    /// Stream of events of `event_type`.
    ///
    /// All streams for the same type share one channel. A new stream first
    /// yields the most recent event of that type, if any. After a terminal
    /// failure streams yield the error once and end; after [`close`] they
    /// are empty.
    ///
    /// [`close`]: EventSource::close
    pub fn on(&self, event_type: &str) -> EventStream<MessageEvent> {
        match self.runtime() {
            Some(rt) => rt.multiplexer.subscribe(event_type, &rt.supervisor),
            None => EventStream::empty(),
        }
    }

    /// Stream of unnamed (`"message"`) events.
    pub fn on_message(&self) -> EventStream<MessageEvent> {
        self.on(MESSAGE_EVENT)
    }

    /// Stream of live connection handles, starting the connection if needed.
    pub fn connection_stream(
        &self,
    ) -> BoxStream<'static, Result<Arc<dyn Connection>, ConnectionError>> {
        match self.runtime() {
            Some(rt) => rt.supervisor.connection_stream(),
            None => Box::pin(futures::stream::empty()),
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        self.runtime.state.current()
    }

    /// Current connection state followed by every transition.
    pub fn ready_state_stream(&self) -> EventStream<ReadyState> {
        self.runtime.state.subscribe()
    }

    /// Supervisor lifecycle events.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.runtime.supervisor.lifecycle_events()
    }

    /// Number of event channels created so far.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.runtime().map_or(0, |rt| rt.multiplexer.channel_count())
    }

    /// Whether the transport is asked to send credentials.
    #[must_use]
    pub const fn with_credentials(&self) -> bool {
        self.policy.with_credentials
    }

    /// String form of the endpoint.
    #[must_use]
    pub fn url(&self) -> &str {
        self.endpoint.as_str()
    }

    /// Retry policy in effect.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Returns true once [`EventSource::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Shut everything down. Idempotent.
    ///
    /// In order: stops the forwarders and the supervisor, closes the current
    /// handle, pins the state at `Closed` and completes its stream, completes
    /// every event channel, then fires the cancellation token.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let rt = &self.runtime;

        let channels = rt.multiplexer.detach_all();
        rt.supervisor.stop();
        rt.supervisor.close_handle();
        rt.state.finish();
        for channel in &channels {
            channel.complete();
        }
        rt.cancel.cancel();

        info!(url = %self.endpoint, channels = channels.len(), "event source closed");
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.close();
    }
}
