//! Connection supervisor with full-jitter reconnection.
//!
//! The supervisor owns the single live [`Connection`] handle. It opens a
//! handle, races its open signal against the connection timeout, and on
//! failure retries with full-jitter exponential backoff until the retry
//! budget runs out. Downstream consumers follow the current handle through
//! a watch channel, so every consumer shares one underlying task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RetryPolicy;
use crate::connection::{
    ConnectOptions, Connection, Connector, Endpoint, ListenerId, ERROR_EVENT, OPEN_EVENT,
};
use crate::error::ConnectionError;
use crate::events::LifecycleEvent;
use crate::state::{ReadyState, StateTracker};

const LIFECYCLE_CAPACITY: usize = 64;

/// What the supervisor currently offers downstream.
#[derive(Clone)]
pub(crate) enum HandleSlot {
    /// No handle has opened yet.
    Pending,
    /// The handle that is open right now.
    Live(Arc<dyn Connection>),
    /// The pipeline failed permanently.
    Failed(ConnectionError),
    /// The pipeline was torn down.
    Closed,
}

/// Signals the supervisor listens for on each handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Open,
    Error,
}

/// Listener registrations for the open/error signals of one handle.
///
/// Removed from the handle when dropped, including when the supervisor
/// task is aborted.
struct SignalGuard {
    handle: Arc<dyn Connection>,
    open_id: ListenerId,
    error_id: ListenerId,
}

impl SignalGuard {
    fn attach(handle: &Arc<dyn Connection>, tx: mpsc::UnboundedSender<Signal>) -> Self {
        let open_tx = tx.clone();
        let open_id = handle.add_event_listener(
            OPEN_EVENT,
            Arc::new(move |_| {
                let _ = open_tx.send(Signal::Open);
            }),
        );
        let error_id = handle.add_event_listener(
            ERROR_EVENT,
            Arc::new(move |_| {
                let _ = tx.send(Signal::Error);
            }),
        );

        Self {
            handle: Arc::clone(handle),
            open_id,
            error_id,
        }
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.handle.remove_event_listener(OPEN_EVENT, self.open_id);
        self.handle.remove_event_listener(ERROR_EVENT, self.error_id);
    }
}

/// The handle the supervisor owns, connecting or open.
struct Current {
    handle: Option<Arc<dyn Connection>>,
    shut_down: bool,
}

struct Shared {
    endpoint: Endpoint,
    policy: RetryPolicy,
    state: Arc<StateTracker>,
    slot_tx: watch::Sender<HandleSlot>,
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,
    current: Mutex<Current>,
    cancel: CancellationToken,
}

/// Owns the retry loop and the current connection handle.
pub struct Supervisor {
    shared: Arc<Shared>,
    connector: Option<Arc<dyn Connector>>,
    started: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Create a supervisor. Nothing connects until the first subscription.
    pub(crate) fn new(
        endpoint: Endpoint,
        policy: RetryPolicy,
        connector: Option<Arc<dyn Connector>>,
        state: Arc<StateTracker>,
        cancel: CancellationToken,
    ) -> Self {
        let (slot_tx, _) = watch::channel(HandleSlot::Pending);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_CAPACITY);

        Self {
            shared: Arc::new(Shared {
                endpoint,
                policy,
                state,
                slot_tx,
                lifecycle_tx,
                current: Mutex::new(Current {
                    handle: None,
                    shut_down: false,
                }),
                cancel,
            }),
            connector,
            started: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Follow the current handle, starting the retry loop on first use.
    pub(crate) fn subscribe(&self) -> watch::Receiver<HandleSlot> {
        self.ensure_started();
        self.shared.slot_tx.subscribe()
    }

    /// Stream of live handles: the current one (if open) and every
    /// replacement. Ends with an `Err` if the pipeline fails, or without
    /// one when the source is closed.
    pub fn connection_stream(&self) -> BoxStream<'static, Result<Arc<dyn Connection>, ConnectionError>> {
        let rx = self.subscribe();

        futures::stream::unfold(Some((rx, true)), |state| async move {
            let (mut rx, first) = state?;
            if !first && rx.changed().await.is_err() {
                return None;
            }

            loop {
                let slot = rx.borrow_and_update().clone();
                match slot {
                    HandleSlot::Live(handle) => return Some((Ok(handle), Some((rx, false)))),
                    HandleSlot::Failed(err) => return Some((Err(err), None)),
                    HandleSlot::Closed => return None,
                    HandleSlot::Pending => {}
                }

                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }

    /// Receiver for supervisor lifecycle events.
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.shared.lifecycle_tx.subscribe()
    }

    /// Returns true once the retry loop has been started.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn ensure_started(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.shared.current.lock().shut_down {
            return;
        }

        let connector = match &self.connector {
            Some(connector) if connector.is_supported() => Arc::clone(connector),
            _ => {
                error!(url = %self.shared.endpoint, "no streaming-connection capability available");
                self.shared.offer(HandleSlot::Failed(ConnectionError::Unsupported));
                self.shared
                    .emit(LifecycleEvent::Failed(ConnectionError::Unsupported));
                return;
            }
        };

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            shared.run(connector).await;
        });
        *self.task.lock() = Some(task);
    }

    /// Stop the retry loop, drop its listeners and detach downstream
    /// consumers. Returns false if already stopped.
    pub(crate) fn stop(&self) -> bool {
        {
            let mut current = self.shared.current.lock();
            if current.shut_down {
                return false;
            }
            current.shut_down = true;
        }

        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.slot_tx.send_replace(HandleSlot::Closed);
        true
    }

    /// Close the current handle, if any.
    pub(crate) fn close_handle(&self) {
        self.shared.close_current();
        self.shared.emit(LifecycleEvent::Closed);
    }
}

impl Shared {
    fn emit(&self, event: LifecycleEvent) {
        let _ = self.lifecycle_tx.send(event);
    }

    /// Publish a slot unless the supervisor has been stopped.
    fn offer(&self, slot: HandleSlot) {
        let current = self.current.lock();
        if !current.shut_down {
            self.slot_tx.send_replace(slot);
        }
    }

    fn close_current(&self) {
        let handle = self.current.lock().handle.take();
        if let Some(handle) = handle {
            debug!(url = handle.url(), "closing connection handle");
            handle.close();
        }
    }

    async fn run(&self, connector: Arc<dyn Connector>) {
        let mut attempt = 0u32;

        loop {
            let Some(failure) = self.run_handle(connector.as_ref(), &mut attempt).await else {
                return;
            };

            if !self.policy.should_retry(attempt) {
                let terminal = ConnectionError::Unrecoverable {
                    attempt,
                    message: failure.to_string(),
                };
                error!(url = %self.endpoint, attempt, error = %failure, "giving up on event stream");

                self.close_current();
                self.state.transition(ReadyState::Closed);
                self.offer(HandleSlot::Failed(terminal.clone()));
                self.emit(LifecycleEvent::Failed(terminal));
                return;
            }

            let delay = self.policy.delay_for_attempt(attempt);
            warn!(
                url = %self.endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "event stream connection failed, retrying"
            );

            // The failed handle must not be replayed to late subscribers.
            self.offer(HandleSlot::Pending);
            self.state.transition(ReadyState::Connecting);
            self.emit(LifecycleEvent::Retrying {
                attempt: attempt + 1,
                delay,
                error: failure,
            });

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = sleep(delay) => {}
            }

            self.close_current();
            attempt += 1;
        }
    }

    /// Open one handle and supervise it until it fails.
    ///
    /// Returns the failure, or `None` if the supervisor was cancelled.
    async fn run_handle(&self, connector: &dyn Connector, attempt: &mut u32) -> Option<ConnectionError> {
        let options = ConnectOptions {
            with_credentials: self.policy.with_credentials,
        };
        let handle = connector.open(self.endpoint.as_str(), &options);

        {
            let mut current = self.current.lock();
            if current.shut_down {
                handle.close();
                return None;
            }
            current.handle = Some(Arc::clone(&handle));
        }

        debug!(url = handle.url(), attempt = *attempt, "opening connection handle");
        self.state.transition(handle.ready_state());
        self.emit(LifecycleEvent::Connecting { attempt: *attempt });

        let (signal_tx, mut signals) = mpsc::unbounded_channel();
        let _guard = SignalGuard::attach(&handle, signal_tx);

        if handle.ready_state() != ReadyState::Open {
            let opened = tokio::select! {
                () = self.cancel.cancelled() => return None,
                result = timeout(self.policy.connection_timeout, wait_for_open(&mut signals, *attempt)) => result,
            };

            match opened {
                Ok(Ok(())) => {}
                Ok(Err(err)) => return Some(err),
                Err(_) => {
                    return Some(ConnectionError::Timeout {
                        timeout: self.policy.connection_timeout,
                    })
                }
            }
        }

        *attempt = 0;
        info!(url = handle.url(), "event stream open");
        self.state.transition(ReadyState::Open);
        self.offer(HandleSlot::Live(Arc::clone(&handle)));
        self.emit(LifecycleEvent::Open);

        loop {
            let signal = tokio::select! {
                () = self.cancel.cancelled() => return None,
                signal = signals.recv() => signal,
            };

            match signal {
                Some(Signal::Open) => {
                    debug!(url = handle.url(), "event stream recovered");
                    self.state.transition(ReadyState::Open);
                    self.emit(LifecycleEvent::Open);
                }
                Some(Signal::Error) => match handle.ready_state() {
                    ReadyState::Closed => {
                        warn!(url = handle.url(), "open event stream closed by transport");
                        return Some(ConnectionError::Dropped { attempt: *attempt });
                    }
                    ReadyState::Connecting => {
                        debug!(url = handle.url(), "event stream interrupted, transport reconnecting");
                        self.state.transition(ReadyState::Connecting);
                        self.emit(LifecycleEvent::Interrupted);
                    }
                    ReadyState::Open => {
                        debug!(url = handle.url(), "transient error on open event stream");
                        self.emit(LifecycleEvent::Interrupted);
                    }
                },
                None => return Some(ConnectionError::Dropped { attempt: *attempt }),
            }
        }
    }
}

async fn wait_for_open(
    signals: &mut mpsc::UnboundedReceiver<Signal>,
    attempt: u32,
) -> Result<(), ConnectionError> {
    match signals.recv().await {
        Some(Signal::Open) => Ok(()),
        Some(Signal::Error) | None => Err(ConnectionError::Dropped { attempt }),
    }
}
