//! Bounded async queue for streaming messages out of a drive loop
//!
//! [`Queue`] is the channel between the core and an external observer: one
//! drive loop pushes [`Message`](crate::messages::Message)s (streamed
//! tokens, completed replies, tool results, system notifications) while a
//! consumer reads them concurrently. The queue is bounded - `put` suspends
//! when the consumer falls behind - and preserves FIFO order.
//!
//! Closing is half-duplex: [`close`](Queue::close) stops producers
//! immediately (`put` fails with `QueueClosed`) while consumers continue to
//! drain buffered items and then observe the end of the stream as `None`.

use crate::error::{CoreError, Result};
use crate::messages::Message;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Queue of messages flowing from a drive loop to its observer.
pub type OutQueue = Queue<Message>;

/// A bounded multi-producer queue with explicit close semantics.
pub struct Queue<T> {
    tx: parking_lot::Mutex<Option<mpsc::Sender<T>>>,
    rx: tokio::sync::Mutex<Option<mpsc::Receiver<T>>>,
}

impl<T: Send + 'static> Queue<T> {
    /// Create a queue holding at most `capacity` buffered items.
    pub fn bounded(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx: parking_lot::Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
        }
    }

    /// Push one item, waiting while the queue is full.
    ///
    /// Fails with [`CoreError::QueueClosed`] once [`close`](Self::close) has
    /// been called.
    pub async fn put(&self, item: T) -> Result<()> {
        let sender = self.tx.lock().clone().ok_or(CoreError::QueueClosed)?;
        sender.send(item).await.map_err(|_| CoreError::QueueClosed)
    }

    /// Pop the next item, waiting for one to arrive.
    ///
    /// Returns `None` once the queue is closed and drained. Concurrent
    /// callers take turns; each item is delivered to exactly one consumer.
    pub async fn get(&self) -> Option<T> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Collect everything remaining until the queue closes.
    ///
    /// Intended for tests and batch consumers; a live observer should loop
    /// on [`get`](Self::get) instead.
    pub async fn drain(&self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.get().await {
            items.push(item);
        }
        items
    }

    /// Stop producers. Buffered items stay readable; `get` returns `None`
    /// after the last one.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Take the receiving half as a [`tokio_stream::Stream`].
    ///
    /// Returns `None` if the receiver was already taken. After this call
    /// [`get`](Self::get) always returns `None`.
    pub async fn into_stream(&self) -> Option<ReceiverStream<T>> {
        self.rx.lock().await.take().map(ReceiverStream::new)
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("closed", &self.tx.lock().is_none())
            .finish()
    }
}
