use std::borrow::Cow;
use std::pin::pin;

use conduit_config::shared::StreamConfig;
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{
    CancellableStreamExt, SendOutcome, StreamRx, StreamTx, create_stream,
};
use crate::error::ConduitResult;
use crate::workers::base::{TaskHandle, Worker, WorkerType};

/// Bridge from an externally owned [`Stream`] into a pipeline.
///
/// [`OrDone`] forwards every element of the source and closes its output the moment the token
/// fires, even if the source never ends on its own. The source is only polled by the or-done
/// worker, so a stalled source never blocks cancellation.
#[derive(Debug)]
pub struct OrDone<S> {
    source: S,
    token: CancellationToken,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<S> OrDone<S>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    /// Wraps `source` so that reading it observes `token`.
    pub fn new(source: S, token: &CancellationToken) -> Self {
        Self {
            source,
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

    /// Labels the wrapper in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<S> Worker for OrDone<S>
where
    S: Stream + Send + 'static,
    S::Item: Send + 'static,
{
    type Output = StreamRx<S::Item>;
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (tx, rx) = create_stream(self.capacity);
        let handle = TaskHandle::spawn(
            WorkerType::OrDone,
            self.name,
            relay(self.source, tx, self.token),
        );

        (rx, handle)
    }
}

async fn relay<S>(source: S, tx: StreamTx<S::Item>, token: CancellationToken) -> ConduitResult<()>
where
    S: Stream,
{
    let mut source = pin!(source.take_until_cancelled(&token));
    let mut relayed = 0u64;

    loop {
        let next = tokio::select! {
            biased;

            _ = tx.closed() => {
                debug!(relayed, "or-done output dropped, stopping");
                return Ok(());
            }
            next = source.next() => next,
        };

        let Some(value) = next else {
            break;
        };

        match tx.send(value, &token).await {
            SendOutcome::Sent => relayed += 1,
            SendOutcome::Cancelled => break,
            SendOutcome::Disconnected => {
                debug!(relayed, "or-done output dropped, stopping");
                return Ok(());
            }
        }
    }

    if token.is_cancelled() {
        debug!(relayed, "or-done cancelled");
    } else {
        debug!(relayed, "or-done source exhausted");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::base::WorkerHandle;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn forwards_a_finite_source_then_closes() {
        let token = CancellationToken::new();
        let source = futures::stream::iter(vec!["a", "b", "c"]);

        let (output, handle) = OrDone::new(source, &token).start();

        let values: Vec<_> = output.collect().await;
        assert_eq!(values, vec!["a", "b", "c"]);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn closes_on_cancellation_when_the_source_never_ends() {
        let token = CancellationToken::new();
        let source = futures::stream::iter(vec![1, 2]).chain(futures::stream::pending());

        let (mut output, handle) = OrDone::new(source, &token).with_capacity(4).start();
        assert_eq!(output.next().await, Some(1));
        assert_eq!(output.next().await, Some(2));

        token.cancel();

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("or-done should stop promptly")
            .unwrap();
        assert_eq!(output.next().await, None);
    }

    #[tokio::test]
    async fn dropped_reader_stops_a_stalled_source() {
        let token = CancellationToken::new();
        let (output, handle) = OrDone::new(futures::stream::pending::<u32>(), &token).start();
        drop(output);

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("or-done should stop once its reader is gone")
            .unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn accepts_a_source_that_is_not_unpin() {
        let token = CancellationToken::new();
        let source = futures::stream::unfold(0u32, |state| async move {
            (state < 3).then_some((state, state + 1))
        });

        let (output, handle) = OrDone::new(source, &token).named("unfold").start();

        let values: Vec<_> = output.collect().await;
        assert_eq!(values, vec![0, 1, 2]);
        assert!(handle.wait().await.is_ok());
    }
}
