use core::pin::Pin;
use core::task::{Context, Poll};
use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, Stream, ready};
use pin_project_lite::pin_project;
use tokio::sync::mpsc;

use crate::concurrency::cancel::CancellationToken;

/// Creates a new pipeline edge with room for `capacity` in-flight elements.
///
/// tokio queues cannot be unbuffered, so a capacity of zero is treated as one, which is the
/// closest equivalent to a rendezvous hand-off.
pub fn create_stream<T>(capacity: usize) -> (StreamTx<T>, StreamRx<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));

    (StreamTx { tx }, StreamRx { rx })
}

/// Result of a cancellation-aware send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The element was enqueued.
    Sent,
    /// The token fired before the queue had room; the element was dropped.
    Cancelled,
    /// The reader is gone; the element was dropped.
    Disconnected,
}

/// Result of a cancellation-aware receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvOutcome<T> {
    /// The next element of the stream.
    Item(T),
    /// Every producer closed the stream and all elements were consumed.
    Closed,
    /// The token fired while waiting.
    Cancelled,
}

/// Writing end of a pipeline edge.
///
/// Dropping every [`StreamTx`] closes the stream. Clones write into the same queue, which is how
/// fan-in forwarders share their downstream.
#[derive(Debug)]
pub struct StreamTx<T> {
    tx: mpsc::Sender<T>,
}

impl<T> StreamTx<T> {
    /// Sends `value`, giving up if `token` fires first.
    ///
    /// Cancellation is checked first, so a cancelled token never lets another element through.
    pub async fn send(&self, value: T, token: &CancellationToken) -> SendOutcome {
        tokio::select! {
            biased;

            _ = token.cancelled() => SendOutcome::Cancelled,
            result = self.tx.send(value) => match result {
                Ok(()) => SendOutcome::Sent,
                Err(_) => SendOutcome::Disconnected,
            },
        }
    }

    /// Returns `true` if the reader was dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Waits until the reader is dropped.
    ///
    /// Workers race this against their upstream so that they stop even when they have nothing
    /// to send. The future is cancel-safe.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// Returns the number of elements the queue can take before a send suspends.
    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

impl<T> Clone for StreamTx<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

pin_project! {
    /// Reading end of a pipeline edge.
    ///
    /// [`StreamRx`] implements [`Stream`], so terminal consumers can drain it with the usual
    /// [`futures::StreamExt`] combinators. Pipeline workers read it through
    /// [`StreamRx::recv`], which also observes the cancellation token.
    #[must_use = "streams do nothing unless polled"]
    #[derive(Debug)]
    pub struct StreamRx<T> {
        rx: mpsc::Receiver<T>,
    }
}

impl<T> StreamRx<T> {
    /// Receives the next element, giving up if `token` fires first.
    pub async fn recv(&mut self, token: &CancellationToken) -> RecvOutcome<T> {
        tokio::select! {
            biased;

            _ = token.cancelled() => RecvOutcome::Cancelled,
            item = self.rx.recv() => match item {
                Some(item) => RecvOutcome::Item(item),
                None => RecvOutcome::Closed,
            },
        }
    }

    /// Returns `true` once every writer is gone and the buffer is empty.
    pub fn is_closed(&self) -> bool {
        self.rx.is_closed() && self.rx.is_empty()
    }
}

impl<T> Stream for StreamRx<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().rx.poll_recv(cx)
    }
}

pin_project! {
    /// A stream adapter that ends as soon as a [`CancellationToken`] fires.
    ///
    /// The cancellation future is polled before the inner stream, so once the token is
    /// cancelled no further element is yielded even if the inner stream has some ready.
    #[must_use = "streams do nothing unless polled"]
    pub struct CancellableStream<S> {
        #[pin]
        stream: S,
        cancelled: BoxFuture<'static, ()>,
        terminated: bool,
    }
}

impl<S: Stream> CancellableStream<S> {
    /// Creates a new [`CancellableStream`] wrapping `stream`.
    pub fn wrap(stream: S, token: &CancellationToken) -> Self {
        let token = token.clone();

        Self {
            stream,
            cancelled: async move { token.cancelled().await }.boxed(),
            terminated: false,
        }
    }
}

impl<S: Stream> Stream for CancellableStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        if *this.terminated {
            return Poll::Ready(None);
        }

        if this.cancelled.as_mut().poll(cx).is_ready() {
            *this.terminated = true;
            return Poll::Ready(None);
        }

        let item = ready!(this.stream.poll_next(cx));
        if item.is_none() {
            *this.terminated = true;
        }

        Poll::Ready(item)
    }
}

impl<S: Stream> FusedStream for CancellableStream<S> {
    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

/// Adds [`CancellableStreamExt::take_until_cancelled`] to every [`Stream`].
pub trait CancellableStreamExt: Stream + Sized {
    /// Ends the stream as soon as `token` is cancelled.
    fn take_until_cancelled(self, token: &CancellationToken) -> CancellableStream<Self> {
        CancellableStream::wrap(self, token)
    }
}

impl<S: Stream> CancellableStreamExt for S {}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn elements_arrive_in_fifo_order_then_closed() {
        let token = CancellationToken::new();
        let (tx, mut rx) = create_stream(4);

        for value in 0..3 {
            assert_eq!(tx.send(value, &token).await, SendOutcome::Sent);
        }
        drop(tx);

        assert_eq!(rx.recv(&token).await, RecvOutcome::Item(0));
        assert_eq!(rx.recv(&token).await, RecvOutcome::Item(1));
        assert_eq!(rx.recv(&token).await, RecvOutcome::Item(2));
        assert_eq!(rx.recv(&token).await, RecvOutcome::Closed);
        // Reading past the end keeps reporting the end of the stream.
        assert_eq!(rx.recv(&token).await, RecvOutcome::Closed);
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn zero_capacity_behaves_like_a_single_slot() {
        let token = CancellationToken::new();
        let (tx, _rx) = create_stream::<u8>(0);

        assert_eq!(tx.capacity(), 1);
        assert_eq!(tx.send(1, &token).await, SendOutcome::Sent);
        assert_eq!(tx.capacity(), 0);
    }

    #[tokio::test]
    async fn blocked_send_is_released_by_cancellation() {
        let token = CancellationToken::new();
        let (tx, _rx) = create_stream(1);
        assert_eq!(tx.send(1, &token).await, SendOutcome::Sent);

        let sender = {
            let token = token.clone();
            tokio::spawn(async move { tx.send(2, &token).await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        let outcome = timeout(Duration::from_secs(1), sender)
            .await
            .expect("send should unblock")
            .unwrap();
        assert_eq!(outcome, SendOutcome::Cancelled);
    }

    #[tokio::test]
    async fn blocked_recv_is_released_by_cancellation() {
        let token = CancellationToken::new();
        let (_tx, mut rx) = create_stream::<u8>(1);

        let receiver = {
            let token = token.clone();
            tokio::spawn(async move { rx.recv(&token).await })
        };

        tokio::task::yield_now().await;
        token.cancel();

        let outcome = timeout(Duration::from_secs(1), receiver)
            .await
            .expect("recv should unblock")
            .unwrap();
        assert_eq!(outcome, RecvOutcome::Cancelled);
    }

    #[tokio::test]
    async fn send_reports_a_dropped_reader() {
        let token = CancellationToken::new();
        let (tx, rx) = create_stream(1);
        drop(rx);

        assert!(tx.is_closed());
        assert_eq!(tx.send(1, &token).await, SendOutcome::Disconnected);
    }

    #[tokio::test]
    async fn closed_resolves_once_the_reader_is_dropped() {
        let (tx, rx) = create_stream::<u8>(1);

        let waiter = tokio::spawn(async move { tx.closed().await });
        tokio::task::yield_now().await;
        drop(rx);

        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("closed() should resolve once the reader is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn cancellable_stream_ends_a_source_that_never_closes() {
        let token = CancellationToken::new();
        let mut stream = futures::stream::iter(vec![1, 2])
            .chain(futures::stream::pending())
            .take_until_cancelled(&token);

        assert_eq!(stream.next().await, Some(1));
        assert_eq!(stream.next().await, Some(2));

        token.cancel();

        let end = timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("stream should end on cancellation");
        assert_eq!(end, None);
        assert!(stream.is_terminated());
    }

    #[tokio::test]
    async fn cancellable_stream_yields_nothing_once_cancelled() {
        let token = CancellationToken::new();
        let (tx, rx) = create_stream(4);
        assert_eq!(tx.send(1, &token).await, SendOutcome::Sent);

        let mut stream = rx.take_until_cancelled(&token);
        token.cancel();

        assert_eq!(stream.next().await, None);
    }
}
