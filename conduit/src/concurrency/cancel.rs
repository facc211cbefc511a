use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Observable state of a [`CancellationToken`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    /// Nobody has cancelled the token yet.
    Active,
    /// The token was cancelled; this state is final.
    Cancelled,
}

/// One-shot broadcast signal shared by every component of a pipeline.
///
/// [`CancellationToken`] wraps a watch channel holding a single flag. Clones share the same
/// channel, so a cancellation issued through any clone is seen by all of them at once: there is
/// no window where one holder observes [`TokenState::Cancelled`] and another still observes
/// [`TokenState::Active`].
///
/// Every blocking operation in the crate races against [`CancellationToken::cancelled`], which
/// is what guarantees that workers unblock promptly once the token fires.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Creates a new token in the [`TokenState::Active`] state.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);

        Self { tx: Arc::new(tx) }
    }

    /// Cancels the token.
    ///
    /// Returns `true` for the call that performed the transition and `false` for every later
    /// call, which is a no-op.
    pub fn cancel(&self) -> bool {
        // `send_if_modified` works without receivers and notifies only on the first call.
        let transitioned = self.tx.send_if_modified(|cancelled| {
            if *cancelled {
                return false;
            }

            *cancelled = true;
            true
        });

        if transitioned {
            info!(
                observers = self.tx.receiver_count(),
                "cancellation requested"
            );
        }

        transitioned
    }

    /// Returns `true` once the token has been cancelled. Never blocks.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Returns the current [`TokenState`].
    pub fn state(&self) -> TokenState {
        if self.is_cancelled() {
            TokenState::Cancelled
        } else {
            TokenState::Active
        }
    }

    /// Waits until the token is cancelled.
    ///
    /// Resolves immediately if the token is already cancelled. The future is cancel-safe, so it
    /// can be raced in `tokio::select!` against any other suspension point.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so waiting can only end through cancellation.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Cancels the token once `deadline` has elapsed.
    ///
    /// This is how timeouts are expressed: there is no separate timeout primitive. The timer task
    /// exits early, without doing anything, if the token is cancelled by someone else first.
    pub fn cancel_after(&self, deadline: Duration) -> JoinHandle<()> {
        let token = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!("token cancelled before the deadline, timer stopped");
                }
                _ = tokio::time::sleep(deadline) => {
                    info!(deadline_ms = deadline.as_millis() as u64, "deadline reached");
                    token.cancel();
                }
            }
        })
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn new_token_is_active() {
        let token = CancellationToken::new();

        assert!(!token.is_cancelled());
        assert_eq!(token.state(), TokenState::Active);
    }

    #[test]
    fn cancel_transitions_exactly_once() {
        let token = CancellationToken::new();
        let clone = token.clone();

        assert!(clone.cancel());
        assert!(!token.cancel());
        assert!(!clone.cancel());

        assert!(token.is_cancelled());
        assert_eq!(clone.state(), TokenState::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel();

        timeout(Duration::from_millis(100), token.cancelled())
            .await
            .expect("cancelled() should not block on a cancelled token");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn every_waiter_is_released_by_one_cancel() {
        let token = CancellationToken::new();

        let waiters = (0..16)
            .map(|_| {
                let token = token.clone();
                tokio::spawn(async move { token.cancelled().await })
            })
            .collect::<Vec<_>>();

        // Give the waiters a chance to park.
        tokio::task::yield_now().await;
        token.cancel();

        for waiter in waiters {
            timeout(Duration::from_secs(1), waiter)
                .await
                .expect("waiter should be released")
                .unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_fires_at_the_deadline() {
        let token = CancellationToken::new();

        let timer = token.cancel_after(Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!token.is_cancelled());

        timer.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_after_stops_when_cancelled_earlier() {
        let token = CancellationToken::new();

        let timer = token.cancel_after(Duration::from_secs(3600));
        token.cancel();

        timeout(Duration::from_millis(10), timer)
            .await
            .expect("timer should exit early")
            .unwrap();
    }
}
