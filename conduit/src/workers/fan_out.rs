use std::future::{Future, pending};
use std::pin::pin;
use std::sync::Arc;

use conduit_config::shared::StreamConfig;
use tokio::sync::Mutex;
use tracing::debug;

use crate::bail;
use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{RecvOutcome, SendOutcome, StreamRx, create_stream};
use crate::error::{ConduitResult, ErrorKind};
use crate::workers::base::{TaskHandle, Worker, WorkerHandle, WorkerType};
use crate::workers::pool::WorkerPool;

/// Upstream shared by every worker of a fan-out group.
///
/// Receiving happens under the lock, so each element is dequeued by exactly one worker.
type SharedUpstream<T> = Arc<Mutex<StreamRx<T>>>;

/// Group of workers draining one shared upstream.
///
/// Every element is handed to exactly one of the workers; which one is unspecified. The work
/// function receives the index of the worker processing the element, which makes it possible
/// to attribute work to workers. Work runs outside of the upstream lock, so workers process
/// elements in parallel.
///
/// The group is complete once the upstream is closed and every worker has finished its last
/// element, or once the token fires.
#[derive(Debug)]
pub struct FanOut<T, F> {
    upstream: StreamRx<T>,
    token: CancellationToken,
    workers: usize,
    work: F,
}

impl<T, F, Fut> FanOut<T, F>
where
    T: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    /// Creates a fan-out group of `workers` workers calling `work` for every element.
    ///
    /// Fails with [`ErrorKind::InvalidConfiguration`] if `workers` is zero.
    pub fn new(
        upstream: StreamRx<T>,
        token: &CancellationToken,
        workers: usize,
        work: F,
    ) -> ConduitResult<Self> {
        if workers == 0 {
            bail!(
                ErrorKind::InvalidConfiguration,
                "Fan-out needs at least one worker"
            );
        }

        Ok(Self {
            upstream,
            token: token.clone(),
            workers,
            work,
        })
    }
}

impl<T, F, Fut> Worker for FanOut<T, F>
where
    T: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    type Output = ();
    type Handle = FanOutHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let upstream = Arc::new(Mutex::new(self.upstream));
        let work = Arc::new(self.work);

        let mut pool = WorkerPool::new();
        for index in 0..self.workers {
            let worker = consume(
                index,
                upstream.clone(),
                work.clone(),
                self.token.clone(),
            );
            pool.register(TaskHandle::spawn(
                WorkerType::FanOutWorker { index },
                None,
                worker,
            ));
        }

        ((), FanOutHandle { pool })
    }
}

/// Fan-out group whose workers produce one result per element.
///
/// Each worker owns one result stream, so [`FanOutMap`] starts with as many output streams as
/// it has workers. Results keep the order in which their worker processed the elements, but
/// there is no ordering across workers. Merge the outputs with a fan-in to get a single
/// stream.
#[derive(Debug)]
pub struct FanOutMap<T, F> {
    upstream: StreamRx<T>,
    token: CancellationToken,
    workers: usize,
    work: F,
    capacity: usize,
}

impl<T> FanOut<T, ()> {
    /// Creates a fan-out group of `workers` workers sending `work(index, value)` to their
    /// own output stream.
    ///
    /// Fails with [`ErrorKind::InvalidConfiguration`] if `workers` is zero.
    pub fn map<U, F, Fut>(
        upstream: StreamRx<T>,
        token: &CancellationToken,
        workers: usize,
        work: F,
    ) -> ConduitResult<FanOutMap<T, F>>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        if workers == 0 {
            bail!(
                ErrorKind::InvalidConfiguration,
                "Fan-out needs at least one worker"
            );
        }

        Ok(FanOutMap {
            upstream,
            token: token.clone(),
            workers,
            work,
            capacity: StreamConfig::DEFAULT_CAPACITY,
        })
    }
}

impl<T, F> FanOutMap<T, F> {
    /// Sets the capacity of every output stream.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
}

impl<T, U, F, Fut> Worker for FanOutMap<T, F>
where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(usize, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = U> + Send + 'static,
{
    type Output = Vec<StreamRx<U>>;
    type Handle = FanOutHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let upstream = Arc::new(Mutex::new(self.upstream));
        let work = Arc::new(self.work);

        let mut pool = WorkerPool::new();
        let mut outputs = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            let (tx, rx) = create_stream(self.capacity);
            let work = work.clone();
            let token = self.token.clone();

            // The worker stops as soon as its own output is dropped or the token fires.
            let output = tx.clone();
            let output_closed = async move { output.closed().await };
            let worker = consume_until(
                index,
                upstream.clone(),
                self.token.clone(),
                output_closed,
                move |value| {
                    let work = work.clone();
                    let tx = tx.clone();
                    let token = token.clone();
                    async move {
                        let result = work(index, value).await;
                        tx.send(result, &token).await == SendOutcome::Sent
                    }
                },
            );

            pool.register(TaskHandle::spawn(
                WorkerType::FanOutWorker { index },
                None,
                worker,
            ));
            outputs.push(rx);
        }

        (outputs, FanOutHandle { pool })
    }
}

/// Handle to the workers of a fan-out group.
///
/// Exposes one completion signal per worker through [`FanOutHandle::workers`], while
/// [`WorkerHandle::wait`] waits for all of them.
#[derive(Debug)]
pub struct FanOutHandle {
    pool: WorkerPool,
}

impl FanOutHandle {
    /// Returns the handles of the individual workers, ordered by worker index.
    pub fn workers(&self) -> &[TaskHandle] {
        self.pool.handles()
    }

    /// Returns the number of workers that are still running.
    pub fn active(&self) -> usize {
        self.pool.active()
    }

    /// Converts this handle into the handles of the individual workers.
    pub fn into_workers(self) -> Vec<TaskHandle> {
        self.pool.into_handles()
    }
}

impl WorkerHandle for FanOutHandle {
    fn is_finished(&self) -> bool {
        self.pool.is_finished()
    }

    fn wait(mut self) -> impl Future<Output = ConduitResult<()>> + Send {
        async move { self.pool.wait_all().await }
    }
}

async fn consume<T, F, Fut>(
    index: usize,
    upstream: SharedUpstream<T>,
    work: Arc<F>,
    token: CancellationToken,
) -> ConduitResult<()>
where
    F: Fn(usize, T) -> Fut,
    Fut: Future<Output = ()>,
{
    // Plain fan-out workers have no output that could be dropped.
    consume_until(index, upstream, token, pending::<()>(), move |value| {
        let work = work.clone();
        async move {
            work(index, value).await;
            true
        }
    })
    .await
}

/// Pulls elements from the shared upstream and hands them to `process`.
///
/// Stops when `process` returns `false` or the upstream ends. A worker waiting for the upstream
/// also stops once `output_closed` resolves.
async fn consume_until<T, C, P, Fut>(
    index: usize,
    upstream: SharedUpstream<T>,
    token: CancellationToken,
    output_closed: C,
    mut process: P,
) -> ConduitResult<()>
where
    C: Future<Output = ()>,
    P: FnMut(T) -> Fut,
    Fut: Future<Output = bool>,
{
    let mut output_closed = pin!(output_closed);
    let mut processed = 0u64;

    loop {
        let outcome = tokio::select! {
            biased;

            _ = &mut output_closed => {
                debug!(worker = index, processed, "fan-out worker output closed, stopping");
                break;
            }
            outcome = next_shared(&upstream, &token) => outcome,
        };

        let value = match outcome {
            RecvOutcome::Item(value) => value,
            RecvOutcome::Closed => {
                debug!(worker = index, processed, "upstream closed, fan-out worker finished");
                break;
            }
            RecvOutcome::Cancelled => {
                debug!(worker = index, processed, "fan-out worker cancelled");
                break;
            }
        };

        if !process(value).await {
            debug!(worker = index, processed, "fan-out worker output closed, stopping");
            break;
        }
        processed += 1;
    }

    Ok(())
}

/// Receives the next element of a shared upstream.
///
/// Waiting for the lock is raced against the token as well, so a worker queued behind a
/// sibling never outlives cancellation.
async fn next_shared<T>(
    upstream: &Mutex<StreamRx<T>>,
    token: &CancellationToken,
) -> RecvOutcome<T> {
    let mut upstream = tokio::select! {
        biased;

        _ = token.cancelled() => return RecvOutcome::Cancelled,
        upstream = upstream.lock() => upstream,
    };

    upstream.recv(token).await
}
