//! Multicast cell with a one-value replay buffer.
//!
//! A [`ReplayCell`] keeps a registry of subscriber queues plus the most
//! recent value. New subscribers receive that value first, then everything
//! published after they joined, in publish order. A cell ends exactly once,
//! either by completing or by failing with a [`ConnectionError`]; late
//! subscribers of an ended cell still receive the buffered value followed by
//! the terminal outcome.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::ConnectionError;

type Item<T> = Result<T, ConnectionError>;

#[derive(Debug, Clone)]
enum Terminal {
    Completed,
    Failed(ConnectionError),
}

#[derive(Debug)]
struct CellInner<T> {
    last: Option<T>,
    subscribers: Vec<mpsc::UnboundedSender<Item<T>>>,
    terminal: Option<Terminal>,
}

/// Broadcast cell retaining the latest value for late subscribers.
#[derive(Debug)]
pub struct ReplayCell<T> {
    inner: Mutex<CellInner<T>>,
}

impl<T: Clone> Default for ReplayCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> ReplayCell<T> {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CellInner {
                last: None,
                subscribers: Vec::new(),
                terminal: None,
            }),
        }
    }

    /// Creates a cell whose buffer already holds `value`.
    #[must_use]
    pub fn with_value(value: T) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                last: Some(value),
                subscribers: Vec::new(),
                terminal: None,
            }),
        }
    }

    /// Publishes a value to every subscriber and buffers it.
    ///
    /// Returns false if the cell has already ended.
    pub fn publish(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return false;
        }

        // Subscribers whose stream was dropped are pruned here.
        inner
            .subscribers
            .retain(|tx| tx.send(Ok(value.clone())).is_ok());
        inner.last = Some(value);
        true
    }

    /// Subscribes to the cell.
    pub fn subscribe(&self) -> EventStream<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();

        if let Some(last) = &inner.last {
            let _ = tx.send(Ok(last.clone()));
        }

        match &inner.terminal {
            None => inner.subscribers.push(tx),
            Some(Terminal::Completed) => {}
            Some(Terminal::Failed(err)) => {
                let _ = tx.send(Err(err.clone()));
            }
        }

        EventStream::new(rx)
    }

    /// Ends every subscriber stream with `error`.
    ///
    /// Returns false if the cell had already ended.
    pub fn fail(&self, error: ConnectionError) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return false;
        }

        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
        inner.terminal = Some(Terminal::Failed(error));
        true
    }

    /// Ends every subscriber stream without an error.
    ///
    /// Returns false if the cell had already ended.
    pub fn complete(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            return false;
        }

        inner.subscribers.clear();
        inner.terminal = Some(Terminal::Completed);
        true
    }

    /// Returns the buffered value, if any.
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.inner.lock().last.clone()
    }

    /// Returns true once the cell has completed or failed.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.lock().terminal.is_some()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

/// Async stream of values from a [`ReplayCell`].
///
/// Yields `Ok` values in publish order, at most one `Err` when the cell
/// fails, and ends when the cell completes or fails.
#[derive(Debug)]
pub struct EventStream<T> {
    receiver: Option<mpsc::UnboundedReceiver<Item<T>>>,
}

impl<T> EventStream<T> {
    fn new(receiver: mpsc::UnboundedReceiver<Item<T>>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// A stream that is already complete and never yields.
    #[must_use]
    pub const fn empty() -> Self {
        Self { receiver: None }
    }

    /// Returns true if this stream was created already complete.
    #[must_use]
    pub const fn is_inert(&self) -> bool {
        self.receiver.is_none()
    }
}

impl<T> Stream for EventStream<T> {
    type Item = Item<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.as_mut() {
            Some(receiver) => receiver.poll_recv(cx),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let cell = ReplayCell::new();
        let mut a = cell.subscribe();
        let mut b = cell.subscribe();

        assert!(cell.publish(1));
        assert!(cell.publish(2));

        assert_eq!(a.next().await, Some(Ok(1)));
        assert_eq!(a.next().await, Some(Ok(2)));
        assert_eq!(b.next().await, Some(Ok(1)));
        assert_eq!(b.next().await, Some(Ok(2)));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_only_latest() {
        let cell = ReplayCell::new();
        cell.publish("first");
        cell.publish("second");

        let mut late = cell.subscribe();
        assert_eq!(late.next().await, Some(Ok("second")));

        cell.publish("third");
        assert_eq!(late.next().await, Some(Ok("third")));
    }

    #[tokio::test]
    async fn test_with_value_replays_initial() {
        let cell = ReplayCell::with_value(2u8);
        let mut stream = cell.subscribe();
        assert_eq!(stream.next().await, Some(Ok(2)));
        assert_eq!(cell.latest(), Some(2));
    }

    #[tokio::test]
    async fn test_complete_ends_streams() {
        let cell = ReplayCell::new();
        let mut stream = cell.subscribe();
        cell.publish(5);

        assert!(cell.complete());
        assert!(!cell.complete());
        assert!(!cell.publish(6));

        assert_eq!(stream.next().await, Some(Ok(5)));
        assert_eq!(stream.next().await, None);

        // Late subscribers see the final value, then the end.
        let mut late = cell.subscribe();
        assert_eq!(late.next().await, Some(Ok(5)));
        assert_eq!(late.next().await, None);
    }

    #[tokio::test]
    async fn test_fail_reaches_current_and_future_subscribers() {
        let cell: ReplayCell<u32> = ReplayCell::new();
        let mut current = cell.subscribe();

        assert!(cell.fail(ConnectionError::Unsupported));
        assert!(!cell.fail(ConnectionError::Unsupported));

        assert_eq!(current.next().await, Some(Err(ConnectionError::Unsupported)));
        assert_eq!(current.next().await, None);

        let mut future = cell.subscribe();
        assert_eq!(future.next().await, Some(Err(ConnectionError::Unsupported)));
        assert_eq!(future.next().await, None);
        assert!(cell.is_terminated());
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let cell = ReplayCell::new();
        let keep = cell.subscribe();
        let dropped = cell.subscribe();
        assert_eq!(cell.subscriber_count(), 2);

        drop(dropped);
        cell.publish(1);
        assert_eq!(cell.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn test_empty_stream_completes_immediately() {
        let mut stream: EventStream<u32> = EventStream::empty();
        assert!(stream.is_inert());
        assert_eq!(stream.next().await, None);
    }
}
