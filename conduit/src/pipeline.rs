use std::future::Future;
use std::time::Duration;

use conduit_config::shared::PipelineConfig;
use futures::Stream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::StreamRx;
use crate::error::{ConduitError, ConduitResult};
use crate::ingress::{
    IngressTx, SourceErrorRx, SourceErrorTx, create_ingress, create_source_error_channel,
};
use crate::workers::base::{TaskHandle, Worker};
use crate::workers::fan_in::FanIn;
use crate::workers::fan_out::FanOut;
use crate::workers::generator::Generator;
use crate::workers::or_done::OrDone;
use crate::workers::pool::WorkerPool;
use crate::workers::stage::Stage;
use crate::workers::tee::Tee;

/// Owner of a pipeline topology.
///
/// [`Pipeline`] creates the cancellation token shared by every component, starts components
/// with the defaults of its [`PipelineConfig`], and keeps the handle of every worker it spawns.
/// Joining the pipeline with [`Pipeline::wait`] therefore guarantees that no worker outlived
/// it.
///
/// Terminal streams are drained by the caller. Waiting on a pipeline whose terminal stream is
/// neither drained nor dropped only returns once the pipeline is cancelled.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    token: CancellationToken,
    pool: WorkerPool,
    timers: Vec<JoinHandle<()>>,
    source_errors_tx: SourceErrorTx,
    source_errors_rx: SourceErrorRx,
}

impl Pipeline {
    /// Creates a pipeline with a fresh cancellation token.
    ///
    /// Fails with [`crate::error::ErrorKind::ConfigError`] if `config` is invalid.
    pub fn new(config: PipelineConfig) -> ConduitResult<Self> {
        Self::with_token(config, CancellationToken::new())
    }

    /// Creates a pipeline observing an existing cancellation token.
    pub fn with_token(config: PipelineConfig, token: CancellationToken) -> ConduitResult<Self> {
        config.validate()?;

        info!(
            capacity = config.stream.capacity,
            fan_out_workers = config.fan_out.workers,
            "creating pipeline"
        );

        let (source_errors_tx, source_errors_rx) = create_source_error_channel();

        Ok(Self {
            config,
            token,
            pool: WorkerPool::new(),
            timers: Vec::new(),
            source_errors_tx,
            source_errors_rx,
        })
    }

    /// Returns the configuration whose defaults are applied to every component.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the cancellation token shared by every component of this pipeline.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns the number of workers that are still running.
    pub fn active_workers(&self) -> usize {
        self.pool.active()
    }

    /// Emits every element of `source`.
    pub fn generate<I>(&mut self, source: I) -> StreamRx<I::Item>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: Send + 'static,
    {
        let generator = Generator::from_iter(&self.token, source)
            .with_capacity(self.config.stream.capacity);

        self.launch(generator)
    }

    /// Emits the values returned by `next` until it returns [`None`].
    pub fn generate_with<T, F>(&mut self, next: F) -> StreamRx<T>
    where
        T: Send + 'static,
        F: FnMut() -> Option<T> + Send + 'static,
    {
        let generator =
            Generator::from_fn(&self.token, next).with_capacity(self.config.stream.capacity);

        self.launch(generator)
    }

    /// Forwards `transform(value)` for every value of `upstream`.
    pub fn map<T, U, F>(&mut self, upstream: StreamRx<T>, transform: F) -> StreamRx<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        let stage = Stage::map(upstream, &self.token, transform)
            .with_capacity(self.config.stream.capacity);

        self.launch(stage)
    }

    /// Forwards the values of `upstream` that `predicate` accepts.
    pub fn filter<T, P>(&mut self, upstream: StreamRx<T>, predicate: P) -> StreamRx<T>
    where
        T: Send + 'static,
        P: FnMut(&T) -> bool + Send + 'static,
    {
        let stage = Stage::filter(upstream, &self.token, predicate)
            .with_capacity(self.config.stream.capacity);

        self.launch(stage)
    }

    /// Forwards `transform(value)` for every value of `upstream` it returns [`Some`] for.
    pub fn filter_map<T, U, F>(&mut self, upstream: StreamRx<T>, transform: F) -> StreamRx<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let stage = Stage::filter_map(upstream, &self.token, transform)
            .with_capacity(self.config.stream.capacity);

        self.launch(stage)
    }

    /// Spreads the values of `upstream` over the configured number of workers.
    pub fn fan_out<T, F, Fut>(&mut self, upstream: StreamRx<T>, work: F) -> ConduitResult<()>
    where
        T: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fan_out = FanOut::new(upstream, &self.token, self.config.fan_out.workers, work)?;

        let ((), handle) = fan_out.start();
        self.pool.register_all(handle.into_workers());

        Ok(())
    }

    /// Spreads the values of `upstream` over the configured number of workers and merges their
    /// results into one stream.
    ///
    /// Results of different workers interleave arbitrarily.
    pub fn fan_out_map<T, U, F, Fut>(
        &mut self,
        upstream: StreamRx<T>,
        work: F,
    ) -> ConduitResult<StreamRx<U>>
    where
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let fan_out = FanOut::map(upstream, &self.token, self.config.fan_out.workers, work)?
            .with_capacity(self.config.stream.capacity);

        let (outputs, handle) = fan_out.start();
        self.pool.register_all(handle.into_workers());

        Ok(self.fan_in(outputs))
    }

    /// Merges `upstreams` into one stream.
    pub fn fan_in<T>(&mut self, upstreams: Vec<StreamRx<T>>) -> StreamRx<T>
    where
        T: Send + 'static,
    {
        let fan_in = FanIn::new(upstreams, &self.token).with_capacity(self.config.stream.capacity);

        self.launch(fan_in)
    }

    /// Duplicates `upstream` into `outputs` identical streams.
    pub fn tee<T>(
        &mut self,
        upstream: StreamRx<T>,
        outputs: usize,
    ) -> ConduitResult<Vec<StreamRx<T>>>
    where
        T: Clone + Send + 'static,
    {
        let tee = Tee::new(upstream, &self.token, outputs)?
            .with_capacity(self.config.stream.capacity);

        Ok(self.launch(tee))
    }

    /// Duplicates `upstream` into two identical streams.
    pub fn tee_pair<T>(&mut self, upstream: StreamRx<T>) -> (StreamRx<T>, StreamRx<T>)
    where
        T: Clone + Send + 'static,
    {
        let tee = Tee::pair(upstream, &self.token).with_capacity(self.config.stream.capacity);

        self.launch(tee)
    }

    /// Brings an external stream into the pipeline.
    ///
    /// The returned stream closes when `source` ends or as soon as the pipeline is cancelled.
    pub fn or_done<S>(&mut self, source: S) -> StreamRx<S::Item>
    where
        S: Stream + Send + 'static,
        S::Item: Send + 'static,
    {
        let or_done = OrDone::new(source, &self.token).with_capacity(self.config.stream.capacity);

        self.launch(or_done)
    }

    /// Creates an entry point for an external producer.
    ///
    /// Source failures reported through the returned [`IngressTx`] are returned by
    /// [`Pipeline::wait`].
    pub fn ingress<T>(&self) -> (IngressTx<T>, StreamRx<T>) {
        create_ingress(
            &self.token,
            self.config.stream.capacity,
            self.source_errors_tx.clone(),
        )
    }

    /// Cancels the pipeline once `deadline` has elapsed.
    pub fn cancel_after(&mut self, deadline: Duration) {
        self.timers.push(self.token.cancel_after(deadline));
    }

    /// Cancels every component of the pipeline.
    pub fn shutdown(&self) {
        if self.token.cancel() {
            info!("pipeline shutdown requested");
        } else {
            debug!("pipeline already cancelled");
        }
    }

    /// Waits for every worker of the pipeline to finish.
    ///
    /// Panicked or aborted workers and source failures reported through ingress handles are
    /// aggregated into a single error.
    pub async fn wait(mut self) -> ConduitResult<()> {
        info!(workers = self.pool.len(), "waiting for pipeline workers to finish");

        let result = self.pool.wait_all().await;

        for timer in self.timers.drain(..) {
            timer.abort();
        }

        let mut errors: Vec<ConduitError> = Vec::new();
        if let Err(err) = result {
            errors.push(err);
        }
        while let Ok(err) = self.source_errors_rx.try_recv() {
            errors.push(err);
        }

        if errors.is_empty() {
            info!("pipeline finished");
            Ok(())
        } else {
            error!(errors = errors.len(), "pipeline finished with errors");
            Err(errors.into())
        }
    }

    /// Cancels the pipeline and waits for every worker to finish.
    pub async fn shutdown_and_wait(self) -> ConduitResult<()> {
        self.shutdown();
        self.wait().await
    }

    fn launch<W>(&mut self, worker: W) -> W::Output
    where
        W: Worker<Handle = TaskHandle>,
    {
        let (output, handle) = worker.start();
        self.pool.register(handle);

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use conduit_config::shared::{FanOutConfig, StreamConfig};
    use futures::StreamExt;
    use std::io;

    #[test]
    fn invalid_config_is_rejected() {
        let config = PipelineConfig {
            stream: StreamConfig { capacity: 0 },
            ..Default::default()
        };

        let err = Pipeline::new(config).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[tokio::test]
    async fn arithmetic_chain_runs_to_completion() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();

        let numbers = pipeline.generate(1..=20);
        let doubled = pipeline.map(numbers, |x| x * 2);
        let odd = pipeline.map(doubled, |x| x + 1);
        let result = pipeline.map(odd, |x| x * 2);

        let values: Vec<i64> = result.collect().await;
        assert_eq!(values, (1..=20).map(|x| ((x * 2) + 1) * 2).collect::<Vec<_>>());
        assert!(pipeline.wait().await.is_ok());
    }

    #[tokio::test]
    async fn fan_out_map_uses_the_configured_width() {
        let config = PipelineConfig {
            fan_out: FanOutConfig { workers: 3 },
            ..Default::default()
        };
        let mut pipeline = Pipeline::new(config).unwrap();

        let numbers = pipeline.generate(0..10u32);
        let results = pipeline
            .fan_out_map(numbers, |index, value| async move { (index, value) })
            .unwrap();

        let results: Vec<(usize, u32)> = results.collect().await;
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|(index, _)| *index < 3));
        assert!(pipeline.wait().await.is_ok());
    }

    #[tokio::test]
    async fn source_failures_are_returned_by_wait() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();

        let (ingress, records) = pipeline.ingress::<String>();
        let upper = pipeline.map(records, |record| record.to_uppercase());

        let producer = tokio::spawn(async move {
            ingress.send("alpha".to_owned()).await;
            ingress.fail(io::Error::other("reader crashed"));
        });

        let values: Vec<String> = upper.collect().await;
        producer.await.unwrap();

        assert_eq!(values, vec!["ALPHA".to_owned()]);
        let err = pipeline.wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SourceFailure);
    }

    #[tokio::test]
    async fn shutdown_and_wait_stops_an_infinite_pipeline() {
        let mut pipeline = Pipeline::new(PipelineConfig::default()).unwrap();

        let mut counter = 0u64;
        let numbers = pipeline.generate_with(move || {
            counter += 1;
            Some(counter)
        });
        let mut evens = pipeline.filter(numbers, |value| value % 2 == 0);

        assert_eq!(evens.next().await, Some(2));
        assert!(pipeline.active_workers() > 0);

        pipeline.shutdown_and_wait().await.unwrap();

        // At most the element buffered before cancellation is left.
        let remaining: Vec<u64> = evens.collect().await;
        assert!(remaining.len() <= 1);
    }
}
