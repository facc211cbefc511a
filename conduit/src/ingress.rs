//! Entry point for external producers.
//!
//! External collaborators (file readers, network clients, ...) push elements into a pipeline
//! through an [`IngressTx`]. Ending the input is always an orderly close of the stream. A
//! failing source closes the stream the same way and reports the failure out-of-band, on the
//! error channel of the pipeline owner, so downstream components never see an error value.

use std::error;

use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::concurrency::cancel::CancellationToken;
use crate::concurrency::stream::{SendOutcome, StreamRx, StreamTx, create_stream};
use crate::conduit_error;
use crate::error::{ConduitError, ErrorKind};

/// Sending half of the out-of-band channel carrying source failures.
pub type SourceErrorTx = mpsc::UnboundedSender<ConduitError>;

/// Receiving half of the out-of-band channel carrying source failures.
pub type SourceErrorRx = mpsc::UnboundedReceiver<ConduitError>;

/// Creates the out-of-band channel carrying source failures to the pipeline owner.
pub fn create_source_error_channel() -> (SourceErrorTx, SourceErrorRx) {
    mpsc::unbounded_channel()
}

/// Creates an ingress edge of the given capacity.
///
/// Returns the handle given to the external producer and the stream the pipeline reads from.
pub fn create_ingress<T>(
    token: &CancellationToken,
    capacity: usize,
    errors: SourceErrorTx,
) -> (IngressTx<T>, StreamRx<T>) {
    let (tx, rx) = create_stream(capacity);
    let ingress = IngressTx {
        tx,
        token: token.clone(),
        errors,
    };

    (ingress, rx)
}

/// Producer handle of an ingress edge.
///
/// Dropping the handle closes the stream like [`IngressTx::finish`] does.
#[derive(Debug)]
pub struct IngressTx<T> {
    tx: StreamTx<T>,
    token: CancellationToken,
    errors: SourceErrorTx,
}

impl<T> IngressTx<T> {
    /// Pushes `value` into the pipeline.
    ///
    /// Suspends while the edge is full and gives up once the token fires. Producers should stop
    /// as soon as anything other than [`SendOutcome::Sent`] is returned.
    pub async fn send(&self, value: T) -> SendOutcome {
        self.tx.send(value, &self.token).await
    }

    /// Returns `true` once the pipeline was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Returns `true` if the pipeline stopped reading this edge.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Closes the stream after the last element.
    pub fn finish(self) {
        debug!("ingress source exhausted");
    }

    /// Closes the stream and reports `cause` as a source failure to the pipeline owner.
    pub fn fail<E>(self, cause: E)
    where
        E: error::Error + Send + Sync + 'static,
    {
        error!(error = %cause, "ingress source failed");

        let err = conduit_error!(
            ErrorKind::SourceFailure,
            "Ingress source failed",
            cause.to_string(),
            source: cause
        );

        if self.errors.send(err).is_err() {
            warn!("source failure could not be reported, the pipeline owner is gone");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io;

    #[tokio::test]
    async fn finish_closes_the_stream_after_the_last_element() {
        let token = CancellationToken::new();
        let (errors_tx, mut errors_rx) = create_source_error_channel();
        let (ingress, rx) = create_ingress(&token, 4, errors_tx);

        for line in ["first", "second"] {
            assert_eq!(ingress.send(line).await, SendOutcome::Sent);
        }
        ingress.finish();

        let values: Vec<_> = rx.collect().await;
        assert_eq!(values, vec!["first", "second"]);
        assert!(errors_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn fail_closes_the_stream_and_reports_out_of_band() {
        let token = CancellationToken::new();
        let (errors_tx, mut errors_rx) = create_source_error_channel();
        let (ingress, mut rx) = create_ingress(&token, 4, errors_tx);

        assert_eq!(ingress.send(1).await, SendOutcome::Sent);
        ingress.fail(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated record"));

        // Downstream sees an orderly close.
        assert_eq!(rx.next().await, Some(1));
        assert_eq!(rx.next().await, None);

        let err = errors_rx.try_recv().unwrap();
        assert_eq!(err.kind(), ErrorKind::SourceFailure);
        assert_eq!(err.detail(), Some("truncated record"));
    }

    #[tokio::test]
    async fn send_gives_up_once_cancelled() {
        let token = CancellationToken::new();
        let (errors_tx, _errors_rx) = create_source_error_channel();
        let (ingress, _rx) = create_ingress(&token, 1, errors_tx);

        assert_eq!(ingress.send(1).await, SendOutcome::Sent);
        token.cancel();

        assert!(ingress.is_cancelled());
        assert_eq!(ingress.send(2).await, SendOutcome::Cancelled);
    }
}
