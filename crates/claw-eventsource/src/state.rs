//! Connection state tracking.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::replay::{EventStream, ReplayCell};

/// State of a connection handle, numbered like the browser `EventSource`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReadyState {
    /// Opening, or reopening after a failure.
    Connecting = 0,
    /// Open and receiving events.
    Open = 1,
    /// Not connected.
    Closed = 2,
}

impl ReadyState {
    /// Numeric value of the state.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Parse a numeric state. Unknown values map to `Closed`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Open,
            _ => Self::Closed,
        }
    }
}

/// Atomic wrapper for a ready state.
#[derive(Debug)]
pub struct AtomicReadyState(AtomicU8);

impl AtomicReadyState {
    /// Create a new atomic state.
    #[must_use]
    pub const fn new(state: ReadyState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    /// Load the current state.
    #[must_use]
    pub fn load(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store a new state.
    pub fn store(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }
}

/// Queryable snapshot plus change stream of the supervisor's state.
///
/// Starts out `Closed`. Once [`StateTracker::finish`] runs the state is
/// pinned to `Closed` and further transitions are ignored.
#[derive(Debug)]
pub struct StateTracker {
    current: AtomicReadyState,
    cell: ReplayCell<ReadyState>,
}

impl Default for StateTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl StateTracker {
    /// Create a tracker in the `Closed` state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: AtomicReadyState::new(ReadyState::Closed),
            cell: ReplayCell::with_value(ReadyState::Closed),
        }
    }

    /// Current state.
    #[must_use]
    pub fn current(&self) -> ReadyState {
        self.current.load()
    }

    /// Stream of the current state followed by every transition.
    pub fn subscribe(&self) -> EventStream<ReadyState> {
        self.cell.subscribe()
    }

    /// Record a transition. Repeats of the current state and writes after
    /// [`StateTracker::finish`] are ignored.
    pub(crate) fn transition(&self, state: ReadyState) {
        if self.current.load() == state {
            return;
        }

        if self.cell.publish(state) {
            self.current.store(state);
            // A concurrent finish() may have slipped in after the publish.
            if self.cell.is_terminated() {
                self.current.store(ReadyState::Closed);
            }
        }
    }

    /// Force a final `Closed` and complete the stream. Idempotent.
    pub(crate) fn finish(&self) {
        if self.current.load() != ReadyState::Closed {
            self.cell.publish(ReadyState::Closed);
        }
        self.current.store(ReadyState::Closed);
        self.cell.complete();
    }

    /// Returns true once the tracker has been finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.cell.is_terminated()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn test_ready_state_values() {
        assert_eq!(ReadyState::Connecting.as_u8(), 0);
        assert_eq!(ReadyState::Open.as_u8(), 1);
        assert_eq!(ReadyState::Closed.as_u8(), 2);
        assert_eq!(ReadyState::from_u8(1), ReadyState::Open);
        assert_eq!(ReadyState::from_u8(9), ReadyState::Closed);
    }

    #[test]
    fn test_atomic_ready_state() {
        let state = AtomicReadyState::new(ReadyState::Closed);
        assert_eq!(state.load(), ReadyState::Closed);

        state.store(ReadyState::Connecting);
        assert_eq!(state.load(), ReadyState::Connecting);

        state.store(ReadyState::Open);
        assert_eq!(state.load(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_tracker_defaults_to_closed() {
        let tracker = StateTracker::new();
        assert_eq!(tracker.current(), ReadyState::Closed);

        let mut stream = tracker.subscribe();
        assert_eq!(stream.next().await, Some(Ok(ReadyState::Closed)));
    }

    #[tokio::test]
    async fn test_tracker_replays_current_then_transitions() {
        let tracker = StateTracker::new();
        tracker.transition(ReadyState::Connecting);

        let mut stream = tracker.subscribe();
        assert_eq!(stream.next().await, Some(Ok(ReadyState::Connecting)));

        tracker.transition(ReadyState::Open);
        assert_eq!(stream.next().await, Some(Ok(ReadyState::Open)));
        assert_eq!(tracker.current(), ReadyState::Open);
    }

    #[tokio::test]
    async fn test_repeated_state_is_not_republished() {
        let tracker = StateTracker::new();
        let mut stream = tracker.subscribe();

        tracker.transition(ReadyState::Connecting);
        tracker.transition(ReadyState::Connecting);
        tracker.transition(ReadyState::Open);
        tracker.finish();

        let seen: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(
            seen,
            vec![
                Ok(ReadyState::Closed),
                Ok(ReadyState::Connecting),
                Ok(ReadyState::Open),
                Ok(ReadyState::Closed)
            ]
        );
    }

    #[tokio::test]
    async fn test_finish_pins_closed() {
        let tracker = StateTracker::new();
        let mut stream = tracker.subscribe();
        tracker.transition(ReadyState::Open);

        tracker.finish();
        tracker.finish();
        tracker.transition(ReadyState::Connecting);

        assert_eq!(tracker.current(), ReadyState::Closed);
        assert!(tracker.is_finished());

        let seen: Vec<_> = stream.by_ref().collect().await;
        assert_eq!(
            seen,
            vec![
                Ok(ReadyState::Closed),
                Ok(ReadyState::Open),
                Ok(ReadyState::Closed)
            ]
        );
    }
}
