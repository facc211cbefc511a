#![allow(dead_code)]

use std::future::Future;
use std::time::Duration;

use conduit::concurrency::stream::StreamRx;
use futures::StreamExt;
use tokio::time::timeout;

/// Upper bound for anything a test waits on.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Drains `stream`, failing the test if it does not close in time.
pub async fn collect_stream<T>(stream: StreamRx<T>) -> Vec<T> {
    timeout(TEST_TIMEOUT, stream.collect())
        .await
        .expect("stream should close before the test timeout")
}

/// Awaits `future`, failing the test if it does not complete in time.
pub async fn bounded<F>(future: F) -> F::Output
where
    F: Future,
{
    timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation should complete before the test timeout")
}

/// Returns `values` sorted, for comparing streams whose interleaving is unspecified.
pub fn sorted<T: Ord>(mut values: Vec<T>) -> Vec<T> {
    values.sort();
    values
}
