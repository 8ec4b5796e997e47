//! Per-event-type channels over the supervised connection.
//!
//! Each event type gets one [`ReplayCell`] and one forwarder task. The
//! forwarder follows the supervisor's current handle and keeps exactly one
//! raw listener registered on it, moving the listener whenever the handle is
//! swapped.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::connection::{Connection, EventListener, ListenerId, MessageEvent};
use crate::error::ListenerError;
use crate::replay::{EventStream, ReplayCell};
use crate::supervisor::{HandleSlot, Supervisor};

type Channel = Arc<ReplayCell<MessageEvent>>;

struct Attachment {
    handle: Arc<dyn Connection>,
    id: ListenerId,
}

struct GateState {
    generation: u64,
    stopped: bool,
    attached: Option<Attachment>,
}

/// Serializes delivery against handle swaps for one event type.
///
/// Every listener carries the generation it was registered under and only
/// publishes while holding the gate with that generation still current.
/// Swapping bumps the generation first, so once a swap starts nothing from
/// the old handle reaches the channel.
struct Gate {
    event_type: String,
    state: Mutex<GateState>,
}

/// A listener that could not forward, with the registration to remove.
struct Failure {
    error: ListenerError,
    attachment: Attachment,
}

impl Gate {
    fn new(event_type: String) -> Self {
        Self {
            event_type,
            state: Mutex::new(GateState {
                generation: 0,
                stopped: false,
                attached: None,
            }),
        }
    }

    /// Move the raw listener onto `handle`.
    fn attach(
        self: &Arc<Self>,
        handle: &Arc<dyn Connection>,
        channel: &Channel,
        failures: &mpsc::UnboundedSender<Failure>,
    ) {
        let (previous, generation) = {
            let mut state = self.state.lock();
            if state.stopped {
                return;
            }
            state.generation += 1;
            (state.attached.take(), state.generation)
        };

        if let Some(previous) = previous {
            debug!(event_type = %self.event_type, url = previous.handle.url(), "detaching from replaced handle");
            previous.detach(&self.event_type);
        }

        let listener = self.listener(generation, Arc::clone(channel), failures.clone());
        let id = handle.add_event_listener(&self.event_type, listener);

        let mut state = self.state.lock();
        if state.stopped || state.generation != generation {
            drop(state);
            handle.remove_event_listener(&self.event_type, id);
            return;
        }
        state.attached = Some(Attachment {
            handle: Arc::clone(handle),
            id,
        });
        debug!(event_type = %self.event_type, url = handle.url(), "forwarding from handle");
    }

    /// Remove the raw listener and refuse any further deliveries.
    fn stop(&self) {
        let previous = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.stopped = true;
            state.attached.take()
        };

        if let Some(previous) = previous {
            previous.detach(&self.event_type);
        }
    }

    fn listener(
        self: &Arc<Self>,
        generation: u64,
        channel: Channel,
        failures: mpsc::UnboundedSender<Failure>,
    ) -> EventListener {
        let gate = Arc::clone(self);

        Arc::new(move |event: &MessageEvent| {
            let mut state = gate.state.lock();
            if state.stopped || state.generation != generation {
                return;
            }

            if let Err(error) = forward(&channel, &gate.event_type, event) {
                // Retire this registration only; the next handle gets a fresh one.
                state.generation += 1;
                let attachment = state.attached.take();
                drop(state);
                warn!(event_type = %gate.event_type, error = %error, "event listener failed, detaching from handle");
                if let Some(attachment) = attachment {
                    let _ = failures.send(Failure { error, attachment });
                }
            }
        })
    }
}

impl Attachment {
    fn detach(&self, event_type: &str) {
        self.handle.remove_event_listener(event_type, self.id);
    }
}

fn forward(channel: &Channel, event_type: &str, event: &MessageEvent) -> Result<(), ListenerError> {
    if event.event_type != event_type {
        return Err(ListenerError::UnexpectedType {
            expected: event_type.to_string(),
            actual: event.event_type.clone(),
        });
    }

    if channel.publish(event.clone()) {
        Ok(())
    } else {
        Err(ListenerError::ChannelClosed(event_type.to_string()))
    }
}

struct ChannelEntry {
    channel: Channel,
    gate: Arc<Gate>,
    task: JoinHandle<()>,
}

/// Registry of event channels keyed by event type.
pub(crate) struct Multiplexer {
    /// `None` once torn down.
    channels: Mutex<Option<HashMap<String, ChannelEntry>>>,
    cancel: CancellationToken,
}

impl Multiplexer {
    pub(crate) fn new(cancel: CancellationToken) -> Self {
        Self {
            channels: Mutex::new(Some(HashMap::new())),
            cancel,
        }
    }

    /// Subscribe to `event_type`, creating its channel and forwarder on
    /// first use. Returns an empty, completed stream after teardown.
    pub(crate) fn subscribe(&self, event_type: &str, supervisor: &Supervisor) -> EventStream<MessageEvent> {
        let mut guard = self.channels.lock();
        let Some(channels) = guard.as_mut() else {
            return EventStream::empty();
        };

        if let Some(entry) = channels.get(event_type) {
            return entry.channel.subscribe();
        }

        debug!(event_type, "creating event channel");
        let channel: Channel = Arc::new(ReplayCell::new());
        let stream = channel.subscribe();
        let gate = Arc::new(Gate::new(event_type.to_string()));

        let task = tokio::spawn(run_forwarder(
            Arc::clone(&channel),
            Arc::clone(&gate),
            supervisor.subscribe(),
            self.cancel.clone(),
        ));

        channels.insert(
            event_type.to_string(),
            ChannelEntry {
                channel,
                gate,
                task,
            },
        );
        stream
    }

    /// Number of channels created so far.
    pub(crate) fn channel_count(&self) -> usize {
        self.channels.lock().as_ref().map_or(0, HashMap::len)
    }

    /// Stop every forwarder and hand back the channels for completion.
    /// Later subscriptions get inert streams.
    pub(crate) fn detach_all(&self) -> Vec<Channel> {
        let Some(channels) = self.channels.lock().take() else {
            return Vec::new();
        };

        channels
            .into_values()
            .map(|entry| {
                entry.gate.stop();
                entry.task.abort();
                entry.channel
            })
            .collect()
    }
}

async fn run_forwarder(
    channel: Channel,
    gate: Arc<Gate>,
    mut slots: watch::Receiver<HandleSlot>,
    cancel: CancellationToken,
) {
    let (failure_tx, mut failures) = mpsc::unbounded_channel();
    // Last handle seen live; a handle whose listener failed is not retried.
    let mut followed: Option<Arc<dyn Connection>> = None;

    loop {
        let slot = slots.borrow_and_update().clone();
        match slot {
            HandleSlot::Live(handle) => {
                if !followed
                    .as_ref()
                    .is_some_and(|f| std::ptr::addr_eq(Arc::as_ptr(f), Arc::as_ptr(&handle)))
                {
                    gate.attach(&handle, &channel, &failure_tx);
                    followed = Some(handle);
                }
            }
            HandleSlot::Failed(err) => {
                gate.stop();
                channel.fail(err);
                return;
            }
            HandleSlot::Closed => break,
            HandleSlot::Pending => {}
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    gate.stop();
                    return;
                }
                changed = slots.changed() => {
                    if changed.is_err() {
                        gate.stop();
                        return;
                    }
                    break;
                }
                Some(failure) = failures.recv() => {
                    failure.attachment.detach(&gate.event_type);
                    debug!(
                        event_type = %gate.event_type,
                        url = failure.attachment.handle.url(),
                        error = %failure.error,
                        "stopped forwarding from handle until it is replaced"
                    );
                }
            }
        }
    }

    gate.stop();
}
