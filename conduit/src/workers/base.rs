use std::borrow::Cow;
use std::fmt;
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, warn};

use crate::conduit_error;
use crate::error::{ConduitResult, ErrorKind};

/// Classification of pipeline worker types.
///
/// [`WorkerType`] is attached to every worker span and to the errors produced when a worker
/// panics or is aborted, so a failure can be traced back to the component that caused it.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WorkerType {
    /// Root producer emitting a source sequence.
    Generator,
    /// Single-input, single-output transform.
    Stage,
    /// One member of a fan-out group.
    FanOutWorker {
        /// Position of the worker inside its group.
        index: usize,
    },
    /// Coordinator merging several upstreams into one downstream.
    FanIn,
    /// Forwarder moving one upstream into the fan-in downstream.
    FanInForwarder {
        /// Position of the upstream inside the fan-in group.
        index: usize,
    },
    /// Duplicator delivering every element to all of its outputs.
    Tee,
    /// Forwarder making an external stream observe cancellation.
    OrDone,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generator => write!(f, "generator"),
            Self::Stage => write!(f, "stage"),
            Self::FanOutWorker { index } => write!(f, "fan_out_worker[{index}]"),
            Self::FanIn => write!(f, "fan_in"),
            Self::FanInForwarder { index } => write!(f, "fan_in_forwarder[{index}]"),
            Self::Tee => write!(f, "tee"),
            Self::OrDone => write!(f, "or_done"),
        }
    }
}

/// Trait for pipeline components backed by background workers.
///
/// [`Worker`] is implemented by every component builder. Starting a component spawns its
/// workers and returns immediately with the component's output (usually the reading end of
/// its downstream edge) together with a handle that can be used to wait for completion.
pub trait Worker {
    /// Value handed back to the caller once the workers are running.
    type Output;
    /// Handle used to monitor the spawned workers.
    type Handle: WorkerHandle;

    /// Spawns the workers of this component.
    fn start(self) -> (Self::Output, Self::Handle);
}

/// Handle for monitoring a running worker or group of workers.
pub trait WorkerHandle {
    /// Returns `true` once every worker behind this handle has finished.
    fn is_finished(&self) -> bool;

    /// Waits for the workers to complete and returns the final result.
    ///
    /// A worker that panicked or was aborted is reported as an error. The handle is consumed
    /// by this operation.
    fn wait(self) -> impl Future<Output = ConduitResult<()>> + Send;
}

/// Handle to a single spawned worker task.
#[derive(Debug)]
pub struct TaskHandle {
    worker_type: WorkerType,
    name: Option<Cow<'static, str>>,
    handle: JoinHandle<ConduitResult<()>>,
}

impl TaskHandle {
    /// Spawns `future` as a worker of type `worker_type` inside its own tracing span.
    pub(crate) fn spawn<F>(
        worker_type: WorkerType,
        name: Option<Cow<'static, str>>,
        future: F,
    ) -> Self
    where
        F: Future<Output = ConduitResult<()>> + Send + 'static,
    {
        let worker_span = tracing::debug_span!(
            "worker",
            worker_type = %worker_type,
            worker_name = name.as_deref()
        );
        let worker = async move {
            debug!("worker started");

            let result = future.await;
            match &result {
                Ok(()) => debug!("worker finished"),
                Err(err) => warn!(error = %err, "worker finished with error"),
            }

            result
        }
        .instrument(worker_span.or_current());

        Self {
            worker_type,
            name,
            handle: tokio::spawn(worker),
        }
    }

    /// Returns the type of the worker.
    pub fn worker_type(&self) -> WorkerType {
        self.worker_type
    }

    /// Returns the label given to the worker, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Aborts the worker task.
    ///
    /// Waiting on an aborted worker reports [`ErrorKind::WorkerCancelled`]. Pipelines stop
    /// their workers through the cancellation token instead, which lets every edge close.
    pub fn abort(&self) {
        self.handle.abort();
    }

    fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({name})", self.worker_type),
            None => self.worker_type.to_string(),
        }
    }
}

impl WorkerHandle for TaskHandle {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn wait(self) -> impl Future<Output = ConduitResult<()>> + Send {
        async move {
            let label = self.label();

            self.handle.await.map_err(|err| {
                if err.is_cancelled() {
                    conduit_error!(
                        ErrorKind::WorkerCancelled,
                        "Worker was cancelled",
                        label,
                        source: err
                    )
                } else {
                    error!(worker = %label, "worker panicked");
                    conduit_error!(ErrorKind::WorkerPanic, "Worker panicked", label, source: err)
                }
            })?
        }
    }
}
