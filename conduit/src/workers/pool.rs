use futures::future::join_all;
use tracing::{debug, error};

use crate::error::ConduitResult;
use crate::workers::base::{TaskHandle, WorkerHandle};

/// Pool retaining the handles of every worker a pipeline started.
///
/// [`WorkerPool`] is what makes workers structured: nothing is spawned without its handle
/// ending up in a pool, so joining the pool is enough to know that no worker outlived the
/// pipeline.
#[derive(Debug, Default)]
pub struct WorkerPool {
    handles: Vec<TaskHandle>,
}

impl WorkerPool {
    /// Creates a new empty worker pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a worker to the pool.
    pub fn register(&mut self, handle: TaskHandle) {
        debug!(worker_type = %handle.worker_type(), "registered worker in pool");

        self.handles.push(handle);
    }

    /// Adds several workers to the pool.
    pub fn register_all(&mut self, handles: impl IntoIterator<Item = TaskHandle>) {
        for handle in handles {
            self.register(handle);
        }
    }

    /// Returns the handles currently held by the pool.
    pub fn handles(&self) -> &[TaskHandle] {
        &self.handles
    }

    /// Converts the pool into the handles it holds.
    pub fn into_handles(self) -> Vec<TaskHandle> {
        self.handles
    }

    /// Returns the number of registered workers.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns `true` if no worker is registered.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Returns the number of registered workers that are still running.
    pub fn active(&self) -> usize {
        self.handles
            .iter()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Returns `true` once every registered worker has finished.
    pub fn is_finished(&self) -> bool {
        self.handles.iter().all(|handle| handle.is_finished())
    }

    /// Waits for every registered worker to complete.
    ///
    /// All workers are joined even if some of them fail. Their errors are collected and
    /// returned as a single aggregated error. The pool is empty afterwards.
    pub async fn wait_all(&mut self) -> ConduitResult<()> {
        let handles = std::mem::take(&mut self.handles);
        debug!(workers = handles.len(), "waiting for workers to finish");

        let results = join_all(handles.into_iter().map(|handle| handle.wait())).await;

        let mut errors = Vec::new();
        for result in results {
            if let Err(err) = result {
                error!(error = %err, "worker completed with error");
                errors.push(err);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }
}
