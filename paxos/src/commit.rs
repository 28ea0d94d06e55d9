//! The caller-facing result of a commit.

use std::time::Duration;

use error_stack::Report;
use meridian_core::{Slot, WalEntry};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{AbortReason, TimedOut};

/// Final state of a commit attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    pub committed: bool,
    /// The slot the attempt ran on, once one was resolved.
    pub slot: Option<Slot>,
    /// The entry proposed in the last phase reached.
    pub entry: Option<WalEntry>,
    /// Whether an entry already present in the log was proposed instead of
    /// the caller's value.
    pub used_existing: bool,
    pub abort: Option<AbortReason>,
}

impl CommitOutcome {
    #[must_use]
    pub fn aborted(reason: AbortReason) -> Self {
        Self {
            committed: false,
            slot: None,
            entry: None,
            used_existing: false,
            abort: Some(reason),
        }
    }
}

/// Resolves a [`CommitHandle`]. Only the first resolution takes effect.
#[derive(Debug)]
pub struct CommitResolver {
    tx: watch::Sender<Option<CommitOutcome>>,
}

impl CommitResolver {
    /// Returns whether this call resolved the handle.
    pub fn resolve(&self, outcome: CommitOutcome) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(outcome);
            true
        })
    }
}

/// Awaitable, clonable result of `commit`.
///
/// Resolves exactly once; every clone observes the same value. Dropping or
/// cancelling a handle has no effect on the attempt.
#[derive(Debug, Clone)]
pub struct CommitHandle {
    rx: watch::Receiver<Option<CommitOutcome>>,
    deadline: Instant,
}

impl CommitHandle {
    #[must_use]
    pub fn new(deadline: Instant) -> (Self, CommitResolver) {
        let (tx, rx) = watch::channel(None);
        (Self { rx, deadline }, CommitResolver { tx })
    }

    /// The deadline the commit was requested with; bounds
    /// [`wait_deadline`](Self::wait_deadline).
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Waits for resolution and returns whether the value was committed.
    ///
    /// A resolver dropped without resolving counts as not committed.
    pub async fn wait(&self) -> bool {
        let mut rx = self.rx.clone();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.as_ref().is_some_and(|o| o.committed),
            Err(_) => false,
        }
    }

    /// Like [`wait`](Self::wait), bounded by `timeout`. The attempt keeps
    /// running after a timeout.
    ///
    /// # Errors
    /// [`TimedOut`] if the commit did not resolve in time.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<bool, Report<TimedOut>> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .map_err(|_| Report::new(TimedOut).attach(format!("waited {timeout:?}")))
    }

    /// Like [`wait`](Self::wait), bounded by the timeout given to `commit`.
    /// An already resolved handle answers even after the deadline.
    ///
    /// # Errors
    /// [`TimedOut`] if the deadline passed first.
    pub async fn wait_deadline(&self) -> Result<bool, Report<TimedOut>> {
        tokio::time::timeout_at(self.deadline, self.wait())
            .await
            .map_err(|_| Report::new(TimedOut).attach("commit deadline passed"))
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    #[must_use]
    pub fn outcome(&self) -> Option<CommitOutcome> {
        self.rx.borrow().clone()
    }

    /// Commits cannot be cancelled; always returns `false`.
    #[must_use]
    pub fn cancel(&self) -> bool {
        false
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed() -> CommitOutcome {
        CommitOutcome {
            committed: true,
            slot: Some(Slot::new("eg", 0)),
            entry: Some(WalEntry::accepted(1, None)),
            used_existing: false,
            abort: None,
        }
    }

    #[tokio::test]
    async fn first_resolution_wins() {
        let (handle, resolver) = CommitHandle::new(Instant::now());
        assert!(!handle.is_done());
        assert!(resolver.resolve(committed()));
        assert!(!resolver.resolve(CommitOutcome::aborted(AbortReason::TooConcurrent)));
        assert!(handle.wait().await);
        assert_eq!(handle.outcome(), Some(committed()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_waiters_agree() {
        let (handle, resolver) = CommitHandle::new(Instant::now());
        let waiters: Vec<_> = (0..8)
            .map(|_| {
                let handle = handle.clone();
                tokio::spawn(async move { handle.wait().await })
            })
            .collect();
        tokio::task::yield_now().await;
        resolver.resolve(CommitOutcome::aborted(AbortReason::QuorumUnreachable));
        for waiter in waiters {
            assert!(!waiter.await.unwrap());
        }
    }

    #[tokio::test]
    async fn timed_wait_reports_timeout_then_value() {
        let (handle, resolver) = CommitHandle::new(Instant::now());
        assert!(handle.wait_timeout(Duration::from_millis(10)).await.is_err());
        resolver.resolve(committed());
        assert!(handle.wait_timeout(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn deadline_bounds_the_wait() {
        let (handle, resolver) = CommitHandle::new(Instant::now() + Duration::from_millis(20));
        assert!(handle.wait_deadline().await.is_err());
        // the attempt can still resolve after the caller gave up
        resolver.resolve(committed());
        assert!(handle.wait_deadline().await.unwrap());
    }

    #[tokio::test]
    async fn dropped_resolver_reads_as_not_committed() {
        let (handle, resolver) = CommitHandle::new(Instant::now());
        drop(resolver);
        assert!(!handle.wait().await);
    }

    #[test]
    fn cancel_is_unsupported() {
        let (handle, _resolver) = CommitHandle::new(Instant::now());
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }
}
