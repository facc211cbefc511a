use std::borrow::Cow;
use std::fmt;

use conduit_config::shared::StreamConfig;
use tracing::debug;

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{RecvOutcome, SendOutcome, StreamRx, StreamTx, create_stream};
use crate::error::ConduitResult;
use crate::workers::base::{TaskHandle, Worker, WorkerType};

type Transform<T, U> = Box<dyn FnMut(T) -> Option<U> + Send>;

/// Single-input, single-output transform between two streams.
///
/// A [`Stage`] owns its downstream stream and closes it as soon as the upstream closes or the
/// token fires. A dropped downstream reader stops the stage too. Transforms
/// run inline on the stage worker and are expected to be cheap and non-blocking.
pub struct Stage<T, U> {
    upstream: StreamRx<T>,
    token: CancellationToken,
    transform: Transform<T, U>,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<T, U> Stage<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    /// Creates a stage forwarding `transform(value)` for every value it returns [`Some`] for.
    pub fn filter_map<F>(upstream: StreamRx<T>, token: &CancellationToken, transform: F) -> Self
    where
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        Self {
            upstream,
            token: token.clone(),
            transform: Box::new(transform),
            capacity: StreamConfig::DEFAULT_CAPACITY,
            name: None,
        }
    }

    /// Creates a stage forwarding `transform(value)` for every value.
    pub fn map<F>(upstream: StreamRx<T>, token: &CancellationToken, mut transform: F) -> Self
    where
        F: FnMut(T) -> U + Send + 'static,
    {
        Self::filter_map(upstream, token, move |value| Some(transform(value)))
    }

    /// Sets the capacity of the output stream.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Labels the stage in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<T> Stage<T, T>
where
    T: Send + 'static,
{
    /// Creates a stage forwarding only the values `predicate` accepts.
    pub fn filter<P>(upstream: StreamRx<T>, token: &CancellationToken, mut predicate: P) -> Self
    where
        P: FnMut(&T) -> bool + Send + 'static,
    {
        Self::filter_map(upstream, token, move |value| {
            predicate(&value).then_some(value)
        })
    }
}

impl<T, U> fmt::Debug for Stage<T, U> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("capacity", &self.capacity)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl<T, U> Worker for Stage<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    type Output = StreamRx<U>;
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (tx, rx) = create_stream(self.capacity);
        let handle = TaskHandle::spawn(
            WorkerType::Stage,
            self.name,
            run_stage(self.upstream, tx, self.transform, self.token),
        );

        (rx, handle)
    }
}

async fn run_stage<T, U>(
    mut upstream: StreamRx<T>,
    tx: StreamTx<U>,
    mut transform: Transform<T, U>,
    token: CancellationToken,
) -> ConduitResult<()> {
    let mut forwarded = 0u64;

    loop {
        let outcome = tokio::select! {
            biased;

            _ = tx.closed() => {
                debug!(forwarded, "stage output dropped, stopping");
                break;
            }
            outcome = upstream.recv(&token) => outcome,
        };

        let value = match outcome {
            RecvOutcome::Item(value) => value,
            RecvOutcome::Closed => {
                debug!(forwarded, "upstream closed, stage finished");
                break;
            }
            RecvOutcome::Cancelled => {
                debug!(forwarded, "stage cancelled");
                break;
            }
        };

        let Some(value) = transform(value) else {
            continue;
        };

        match tx.send(value, &token).await {
            SendOutcome::Sent => forwarded += 1,
            SendOutcome::Cancelled => {
                debug!(forwarded, "stage cancelled");
                break;
            }
            SendOutcome::Disconnected => {
                debug!(forwarded, "stage output dropped, stopping");
                break;
            }
        }
    }

    Ok(())
}
