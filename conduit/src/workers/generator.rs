use std::borrow::Cow;
use std::iter::{FromFn, RepeatWith};

use conduit_config::shared::StreamConfig;
use tracing::debug;

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{SendOutcome, StreamRx, StreamTx, create_stream};
use crate::error::ConduitResult;
use crate::workers::base::{TaskHandle, Worker, WorkerType};

/// Root producer of a pipeline.
///
/// [`Generator`] drains a source iterator into a new stream, one element at a time. Every
/// emission races the cancellation token, so a generator over an infinite source stops as
/// soon as the token fires. A finite source closes the stream once it is exhausted.
///
/// The source is pulled from inside an async task, so it must not block.
#[derive(Debug)]
pub struct Generator<I> {
    source: I,
    token: CancellationToken,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<I> Generator<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    /// Creates a generator emitting every element of `source` in order.
    pub fn from_iter<S>(token: &CancellationToken, source: S) -> Self
    where
        S: IntoIterator<IntoIter = I>,
    {
        Self {
            source: source.into_iter(),
            token: token.clone(),
            capacity: StreamConfig::DEFAULT_CAPACITY,
            name: None,
        }
    }

    /// Sets the capacity of the output stream.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Labels the generator in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<T, F> Generator<FromFn<F>>
where
    T: Send + 'static,
    F: FnMut() -> Option<T> + Send + 'static,
{
    /// Creates a generator calling `next` until it returns [`None`].
    ///
    /// A function that never returns [`None`] produces an infinite stream.
    pub fn from_fn(token: &CancellationToken, next: F) -> Self {
        Self::from_iter(token, std::iter::from_fn(next))
    }
}

impl<T, F> Generator<RepeatWith<F>>
where
    T: Send + 'static,
    F: FnMut() -> T + Send + 'static,
{
    /// Creates an infinite generator calling `next` for every element.
    pub fn repeat_with(token: &CancellationToken, next: F) -> Self {
        Self::from_iter(token, std::iter::repeat_with(next))
    }
}

impl<I> Worker for Generator<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Output = StreamRx<I::Item>;
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (tx, rx) = create_stream(self.capacity);
        let handle = TaskHandle::spawn(
            WorkerType::Generator,
            self.name,
            generate(self.source, tx, self.token),
        );

        (rx, handle)
    }
}

async fn generate<I>(
    mut source: I,
    tx: StreamTx<I::Item>,
    token: CancellationToken,
) -> ConduitResult<()>
where
    I: Iterator,
{
    let mut emitted = 0u64;

    loop {
        // The source is not pulled again once the token fired.
        if token.is_cancelled() {
            debug!(emitted, "generator cancelled");
            return Ok(());
        }

        let Some(value) = source.next() else {
            break;
        };

        match tx.send(value, &token).await {
            SendOutcome::Sent => emitted += 1,
            SendOutcome::Cancelled => {
                debug!(emitted, "generator cancelled");
                return Ok(());
            }
            SendOutcome::Disconnected => {
                debug!(emitted, "generator output dropped, stopping");
                return Ok(());
            }
        }
    }

    debug!(emitted, "generator source exhausted");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::base::WorkerHandle;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn finite_source_is_emitted_in_order_then_closed() {
        let token = CancellationToken::new();
        let (rx, handle) = Generator::from_iter(&token, 1..=5).start();

        let values: Vec<_> = rx.collect().await;
        assert_eq!(values, vec![1, 2, 3, 4, 5]);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn from_fn_stops_when_the_function_returns_none() {
        let token = CancellationToken::new();
        let mut remaining = 3;
        let (rx, handle) = Generator::from_fn(&token, move || {
            if remaining == 0 {
                return None;
            }
            remaining -= 1;
            Some(remaining)
        })
        .with_capacity(8)
        .start();

        let values: Vec<_> = rx.collect().await;
        assert_eq!(values, vec![2, 1, 0]);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn infinite_generator_stops_on_cancellation() {
        let token = CancellationToken::new();
        let mut next = 0u64;
        let (mut rx, handle) = Generator::repeat_with(&token, move || {
            next += 1;
            next
        })
        .named("counter")
        .start();

        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.next().await, Some(2));

        token.cancel();

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("generator should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn cancelled_token_emits_nothing() {
        let token = CancellationToken::new();
        token.cancel();

        let (rx, handle) = Generator::from_iter(&token, 0..100).with_capacity(100).start();

        let values: Vec<i32> = rx.collect().await;
        assert!(values.is_empty());
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn source_is_not_pulled_after_cancellation() {
        let token = CancellationToken::new();
        token.cancel();

        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = pulls.clone();
        let (rx, handle) = Generator::repeat_with(&token, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .start();

        assert!(handle.wait().await.is_ok());
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn dropped_reader_stops_the_generator() {
        let token = CancellationToken::new();
        let (rx, handle) = Generator::repeat_with(&token, || 1).start();
        drop(rx);

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("generator should stop once its reader is gone")
            .unwrap();
    }
}
