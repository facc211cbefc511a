use std::borrow::Cow;

use conduit_config::shared::StreamConfig;
use futures::future::join_all;
use tracing::debug;

use crate::bail;
use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{RecvOutcome, SendOutcome, StreamRx, StreamTx, create_stream};
use crate::error::{ConduitResult, ErrorKind};
use crate::workers::base::{TaskHandle, Worker, WorkerType};

/// Duplicator delivering every upstream element to all of its outputs.
///
/// Each element is delivered to every output before the next one is read, so all outputs
/// receive identical, order-preserving copies. There is no buffering beyond the capacity of
/// each output: a stalled reader holds back the upstream, and with it every other output,
/// until the token fires. Deliveries of one element run concurrently and each of them races
/// the token, so cancellation is never blocked by a stalled reader.
///
/// An output whose reader was dropped is detached and the remaining outputs keep being served.
/// The tee also stops once every reader is gone. All outputs are closed together when it stops.
#[derive(Debug)]
pub struct Tee<T> {
    upstream: StreamRx<T>,
    token: CancellationToken,
    outputs: usize,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<T> Tee<T>
where
    T: Clone + Send + 'static,
{
    /// Creates a tee with `outputs` outputs.
    ///
    /// Fails with [`ErrorKind::InvalidConfiguration`] if fewer than two outputs are requested.
    pub fn new(
        upstream: StreamRx<T>,
        token: &CancellationToken,
        outputs: usize,
    ) -> ConduitResult<Self> {
        if outputs < 2 {
            bail!(
                ErrorKind::InvalidConfiguration,
                "Tee needs at least two outputs",
                format!("requested {outputs} output(s)")
            );
        }

        Ok(Self {
            upstream,
            token: token.clone(),
            outputs,
            capacity: StreamConfig::DEFAULT_CAPACITY,
            name: None,
        })
    }

    /// Creates a tee with exactly two outputs.
    pub fn pair(upstream: StreamRx<T>, token: &CancellationToken) -> TeePair<T> {
        TeePair {
            upstream,
            token: token.clone(),
            capacity: StreamConfig::DEFAULT_CAPACITY,
            name: None,
        }
    }

    /// Sets the capacity of every output stream.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Labels the tee in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<T> Worker for Tee<T>
where
    T: Clone + Send + 'static,
{
    type Output = Vec<StreamRx<T>>;
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (txs, rxs): (Vec<_>, Vec<_>) = (0..self.outputs)
            .map(|_| create_stream(self.capacity))
            .unzip();

        let handle = TaskHandle::spawn(
            WorkerType::Tee,
            self.name,
            duplicate(self.upstream, txs, self.token),
        );

        (rxs, handle)
    }
}

/// Two-output form of [`Tee`], built by [`Tee::pair`].
#[derive(Debug)]
pub struct TeePair<T> {
    upstream: StreamRx<T>,
    token: CancellationToken,
    capacity: usize,
    name: Option<Cow<'static, str>>,
}

impl<T> TeePair<T> {
    /// Sets the capacity of both output streams.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Labels the tee in logs and errors.
    pub fn named(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl<T> Worker for TeePair<T>
where
    T: Clone + Send + 'static,
{
    type Output = (StreamRx<T>, StreamRx<T>);
    type Handle = TaskHandle;

    fn start(self) -> (Self::Output, Self::Handle) {
        let (left_tx, left_rx) = create_stream(self.capacity);
        let (right_tx, right_rx) = create_stream(self.capacity);

        let handle = TaskHandle::spawn(
            WorkerType::Tee,
            self.name,
            duplicate(self.upstream, vec![left_tx, right_tx], self.token),
        );

        ((left_rx, right_rx), handle)
    }
}

async fn duplicate<T>(
    mut upstream: StreamRx<T>,
    outputs: Vec<StreamTx<T>>,
    token: CancellationToken,
) -> ConduitResult<()>
where
    T: Clone,
{
    // Detached outputs are set to `None`, which closes them while keeping indices stable.
    let mut outputs: Vec<Option<StreamTx<T>>> = outputs.into_iter().map(Some).collect();
    let mut duplicated = 0u64;

    loop {
        // Resolves once every attached reader is gone.
        let readers_gone = join_all(outputs.iter().flatten().map(|tx| tx.closed()));

        let outcome = tokio::select! {
            biased;

            _ = readers_gone => {
                debug!(duplicated, "every tee output dropped, stopping");
                break;
            }
            outcome = upstream.recv(&token) => outcome,
        };

        let value = match outcome {
            RecvOutcome::Item(value) => value,
            RecvOutcome::Closed => {
                debug!(duplicated, "upstream closed, tee finished");
                break;
            }
            RecvOutcome::Cancelled => {
                debug!(duplicated, "tee cancelled");
                break;
            }
        };

        let deliveries = outputs
            .iter()
            .enumerate()
            .filter_map(|(index, output)| output.as_ref().map(|tx| (index, tx)))
            .map(|(index, tx)| {
                let value = value.clone();
                let token = &token;
                async move { (index, tx.send(value, token).await) }
            });
        let outcomes = join_all(deliveries).await;

        let mut cancelled = false;
        for (index, outcome) in outcomes {
            match outcome {
                SendOutcome::Sent => {}
                SendOutcome::Cancelled => cancelled = true,
                SendOutcome::Disconnected => {
                    debug!(output = index, "tee output dropped, detaching it");
                    outputs[index] = None;
                }
            }
        }

        if cancelled {
            debug!(duplicated, "tee cancelled");
            break;
        }

        if outputs.iter().all(Option::is_none) {
            debug!(duplicated, "every tee output dropped, stopping");
            break;
        }

        duplicated += 1;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::base::WorkerHandle;
    use crate::workers::generator::Generator;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn fewer_than_two_outputs_is_rejected() {
        let token = CancellationToken::new();
        for outputs in [0, 1] {
            let (_tx, rx) = create_stream::<u32>(1);

            let err = Tee::new(rx, &token, outputs).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidConfiguration);
        }
    }

    #[tokio::test]
    async fn every_output_gets_an_identical_copy() {
        let token = CancellationToken::new();
        let (numbers, _generator) = Generator::from_iter(&token, 0..25).start();

        let (outputs, handle) = Tee::new(numbers, &token, 4).unwrap().start();
        assert_eq!(outputs.len(), 4);

        let copies =
            join_all(outputs.into_iter().map(|output| output.collect::<Vec<i32>>())).await;
        for copy in copies {
            assert_eq!(copy, (0..25).collect::<Vec<_>>());
        }
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn pair_duplicates_into_two_streams() {
        let token = CancellationToken::new();
        let (words, _generator) = Generator::from_iter(&token, ["x", "y", "z"]).start();

        let ((left, right), handle) = Tee::pair(words, &token).named("mirror").start();
        let (left, right) = tokio::join!(left.collect::<Vec<_>>(), right.collect::<Vec<_>>());

        assert_eq!(left, vec!["x", "y", "z"]);
        assert_eq!(right, left);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn stalled_reader_holds_back_the_others_until_cancellation() {
        let token = CancellationToken::new();
        let (numbers, _generator) = Generator::repeat_with(&token, || 1u8).start();

        let ((mut active, _stalled), handle) = Tee::pair(numbers, &token).start();

        // The stalled reader buffers the first element, then the tee blocks on delivering it
        // the second one and stops pulling from the upstream.
        assert_eq!(active.next().await, Some(1));
        assert_eq!(active.next().await, Some(1));
        assert!(
            timeout(Duration::from_millis(50), active.next())
                .await
                .is_err()
        );

        token.cancel();

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("tee should stop promptly even with a stalled reader")
            .unwrap();
    }

    #[tokio::test]
    async fn tee_with_an_idle_upstream_stops_once_every_reader_is_dropped() {
        let token = CancellationToken::new();
        let (_upstream_tx, upstream) = create_stream::<u32>(1);

        let (outputs, handle) = Tee::new(upstream, &token, 3).unwrap().start();
        drop(outputs);

        timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("tee should stop once every reader is gone")
            .unwrap();
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn tee_keeps_serving_while_one_reader_remains() {
        let token = CancellationToken::new();
        let (upstream_tx, upstream) = create_stream::<u32>(1);

        let ((left, mut right), handle) = Tee::pair(upstream, &token).start();
        drop(left);

        assert_eq!(upstream_tx.send(5, &token).await, SendOutcome::Sent);
        assert_eq!(right.next().await, Some(5));
        assert!(!handle.is_finished());

        drop(upstream_tx);
        assert_eq!(right.next().await, None);
        assert!(handle.wait().await.is_ok());
    }

    #[tokio::test]
    async fn dropped_reader_is_detached() {
        let token = CancellationToken::new();
        let (numbers, _generator) = Generator::from_iter(&token, 0..10).start();

        let ((left, right), handle) = Tee::pair(numbers, &token).start();
        drop(right);

        let values: Vec<i32> = left.collect().await;
        assert_eq!(values, (0..10).collect::<Vec<_>>());
        assert!(handle.wait().await.is_ok());
    }
}
