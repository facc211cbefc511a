use std::borrow::Cow;

use conduit_config::shared::StreamConfig;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error};

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{RecvOutcome, SendOutcome, StreamRx, StreamTx, create_stream};
use crate::conduit_error;
use crate::error::{ConduitResult, ErrorKind};
use crate::workers::base::{TaskHandle, Worker, WorkerType};

/// How a fan-in forwarder stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwarderExit {
    /// The upstream was closed and fully forwarded.
    Exhausted,
    /// The token fired.
    Cancelled,
    /// The downstream reader is gone.
    Disconnected,
}

/// Multiplexer merging several upstreams into one downstream.
///
/// [`FanIn`] starts one forwarder per upstream plus a coordinator that owns them. The
/// coordinator counts exhausted upstreams and the downstream closes once every forwarder is
/// done, which happens when all upstreams are closed or as soon as the token fires. Order is
/// kept within each upstream, while elements of different upstreams interleave arbitrarily.
///
/// Merging zero upstreams yields a downstream that is closed right away.
#[derive(Debug)]
pub struct FanIn<T> {
    upstreams: Vec<StreamRx<T>>,
    token: CancellationToken,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<T> FanIn<T>
where
    T: Send + 'static,
{
    /// Creates a fan-in merging `upstreams`.
    pub fn new(upstreams: Vec<StreamRx<T>>, token: &CancellationToken) -> Self {
        Self {
            upstreams,
            token: token.clone(),
            capacity: StreamConfig::DEFAULT_CAPACITY,
            name: None,
        }
    }

    /// Sets the capacity of the downstream.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Labels the fan-in in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<T> Worker for FanIn<T>
where
    T: Send + 'static,
{
    type Output = StreamRx<T>;
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (tx, rx) = create_stream(self.capacity);
        let handle = TaskHandle::spawn(
            WorkerType::FanIn,
            self.name,
            coordinate(self.upstreams, tx, self.token),
        );

        (rx, handle)
    }
}

/// Runs the forwarders of a fan-in and waits for all of them.
///
/// The coordinator drops its own writer before waiting, so the downstream is closed exactly
/// when the last forwarder exits. Aborting the coordinator drops the [`JoinSet`], which aborts
/// the forwarders with it.
async fn coordinate<T>(
    upstreams: Vec<StreamRx<T>>,
    tx: StreamTx<T>,
    token: CancellationToken,
) -> ConduitResult<()>
where
    T: Send + 'static,
{
    let total = upstreams.len();

    let mut forwarders = JoinSet::new();
    for (index, upstream) in upstreams.into_iter().enumerate() {
        let forwarder_span = tracing::debug_span!(
            "worker",
            worker_type = %WorkerType::FanInForwarder { index }
        );
        forwarders.spawn(
            forward(upstream, tx.clone(), token.clone()).instrument(forwarder_span.or_current()),
        );
    }
    drop(tx);

    let mut exhausted = 0usize;
    let mut errors = Vec::new();
    while let Some(result) = forwarders.join_next().await {
        match result {
            Ok(ForwarderExit::Exhausted) => {
                exhausted += 1;
                debug!(exhausted, total, "fan-in upstream exhausted");
            }
            Ok(exit) => {
                debug!(?exit, "fan-in forwarder stopped");
            }
            Err(err) if err.is_cancelled() => {
                errors.push(conduit_error!(
                    ErrorKind::WorkerCancelled,
                    "Fan-in forwarder was cancelled",
                    source: err
                ));
            }
            Err(err) => {
                error!("fan-in forwarder panicked");
                errors.push(conduit_error!(
                    ErrorKind::WorkerPanic,
                    "Fan-in forwarder panicked",
                    source: err
                ));
            }
        }
    }

    if exhausted == total {
        debug!(total, "every fan-in upstream exhausted, downstream closed");
    } else {
        debug!(exhausted, total, "fan-in stopped before every upstream was exhausted");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.into())
    }
}

async fn forward<T>(
    mut upstream: StreamRx<T>,
    tx: StreamTx<T>,
    token: CancellationToken,
) -> ForwarderExit {
    loop {
        let outcome = tokio::select! {
            biased;

            _ = tx.closed() => return ForwarderExit::Disconnected,
            outcome = upstream.recv(&token) => outcome,
        };

        let value = match outcome {
            RecvOutcome::Item(value) => value,
            RecvOutcome::Closed => return ForwarderExit::Exhausted,
            RecvOutcome::Cancelled => return ForwarderExit::Cancelled,
        };

        match tx.send(value, &token).await {
            SendOutcome::Sent => {}
            SendOutcome::Cancelled => return ForwarderExit::Cancelled,
            SendOutcome::Disconnected => return ForwarderExit::Disconnected,
        }
    }
}
