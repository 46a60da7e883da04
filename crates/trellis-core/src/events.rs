//! Bounded multi-producer event queue with an explicit lifecycle.
//!
//! Many producer tasks emit into one [`EventStream`]. The stream's
//! [`StreamState`] says whether more events can still arrive, so callers
//! never have to infer closure from a channel being garbage collected.

use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::context::{Context, ContextError};

/// Lifecycle of an [`EventStream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// At least one producer is alive.
    Open,
    /// Every producer is gone. Buffered events may still be read.
    Draining,
    /// Every producer is gone and the buffer is empty. Terminal.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("event stream was dropped by its consumer")]
    Closed,

    #[error(transparent)]
    Context(#[from] ContextError),
}

/// Create a bounded queue holding at most `capacity` undelivered events.
pub fn channel<T>(capacity: usize) -> (EventSender<T>, EventStream<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let producers = Arc::new(AtomicUsize::new(1));
    (
        EventSender {
            tx,
            producers: producers.clone(),
        },
        EventStream {
            rx,
            producers,
            closed: false,
        },
    )
}

/// Producer half. Cloning registers another producer.
#[derive(Debug)]
pub struct EventSender<T> {
    tx: mpsc::Sender<T>,
    producers: Arc<AtomicUsize>,
}

impl<T> Clone for EventSender<T> {
    fn clone(&self) -> Self {
        self.producers.fetch_add(1, Ordering::AcqRel);
        Self {
            tx: self.tx.clone(),
            producers: self.producers.clone(),
        }
    }
}

impl<T> Drop for EventSender<T> {
    fn drop(&mut self) {
        self.producers.fetch_sub(1, Ordering::AcqRel);
    }
}

impl<T> EventSender<T> {
    /// Queue `event`, waiting for room if the consumer is behind.
    ///
    /// Returns early if `ctx` ends; nothing is queued in that case.
    pub async fn emit(&self, ctx: &Context, event: T) -> Result<(), EmitError> {
        match ctx.run(self.tx.send(event)).await? {
            Ok(()) => Ok(()),
            Err(_) => Err(EmitError::Closed),
        }
    }

    /// True once the consumer has dropped its [`EventStream`].
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half of the queue.
#[derive(Debug)]
pub struct EventStream<T> {
    rx: mpsc::Receiver<T>,
    producers: Arc<AtomicUsize>,
    closed: bool,
}

impl<T> EventStream<T> {
    /// A stream that is closed from the start.
    pub fn closed() -> Self {
        let (tx, rx) = channel(1);
        drop(tx);
        let mut stream = rx;
        stream.rx.close();
        stream.closed = true;
        stream
    }

    pub fn state(&self) -> StreamState {
        if self.closed {
            StreamState::Closed
        } else if self.producers.load(Ordering::Acquire) == 0 {
            StreamState::Draining
        } else {
            StreamState::Open
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Next event, or `None` once the stream is [`StreamState::Closed`].
    pub async fn recv(&mut self) -> Option<T> {
        if self.closed {
            return None;
        }
        let next = self.rx.recv().await;
        if next.is_none() {
            self.closed = true;
        }
        next
    }

    /// Drain every remaining event until the stream closes.
    pub async fn collect_all(mut self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(event) = self.recv().await {
            out.push(event);
        }
        out
    }
}

impl<T> Stream for EventStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<T>> {
        if self.closed {
            return Poll::Ready(None);
        }
        let polled = self.rx.poll_recv(cx);
        if let Poll::Ready(None) = polled {
            self.closed = true;
        }
        polled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stream_closes_after_last_producer() {
        let ctx = Context::background();
        let (tx, mut rx) = channel::<u32>(4);
        let tx2 = tx.clone();

        tx.emit(&ctx, 1).await.unwrap();
        drop(tx);
        assert_eq!(rx.state(), StreamState::Open);

        tx2.emit(&ctx, 2).await.unwrap();
        drop(tx2);
        assert_eq!(rx.state(), StreamState::Draining);

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        assert_eq!(rx.state(), StreamState::Closed);
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_emit_respects_context_when_full() {
        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        let (tx, _rx) = channel::<u32>(1);
        tx.emit(&ctx, 1).await.unwrap();

        let blocked = tx.emit(&ctx, 2).await;
        assert_eq!(blocked, Err(EmitError::Context(ContextError::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_emit_after_consumer_dropped() {
        let (tx, rx) = channel::<u32>(1);
        drop(rx);
        assert!(tx.is_abandoned());
        assert_eq!(tx.emit(&Context::background(), 1).await, Err(EmitError::Closed));
    }

    #[tokio::test]
    async fn test_closed_stream_is_terminal() {
        let mut stream = EventStream::<u8>::closed();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_fan_in_from_many_tasks() {
        let ctx = Context::background();
        let (tx, rx) = channel::<usize>(2);
        for i in 0..8 {
            let tx = tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tx.emit(&ctx, i).await.unwrap();
            });
        }
        drop(tx);

        let mut got = rx.collect_all().await;
        got.sort_unstable();
        assert_eq!(got, (0..8).collect::<Vec<_>>());
    }
}
