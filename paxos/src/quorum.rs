//! Replica-level acknowledgement counting for one phase of a commit attempt.

use std::collections::BTreeSet;
use std::sync::{Mutex, PoisonError};

use meridian_core::{WalEntry, quorum, quorum_impossible};
use tokio::sync::oneshot;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuorumDecision {
    Reached,
    /// Enough replicas failed that [`quorum`] can no longer be reached.
    Impossible,
}

struct TrackerState {
    acked: BTreeSet<String>,
    failed: BTreeSet<String>,
    highest_accepted: Option<WalEntry>,
    decision: Option<QuorumDecision>,
    notify: Option<oneshot::Sender<QuorumDecision>>,
}

/// Counts acks and failures per replica and decides once.
///
/// Shared between the coordinator and transport response handlers. The
/// first transition to a decision wins; later calls are ignored.
pub struct QuorumTracker {
    needed: usize,
    impossible_at: usize,
    state: Mutex<TrackerState>,
}

impl QuorumTracker {
    /// Returns the tracker and a receiver that fires with its decision.
    #[must_use]
    pub fn new(num_replicas: usize) -> (Self, oneshot::Receiver<QuorumDecision>) {
        let (tx, rx) = oneshot::channel();
        let tracker = Self {
            needed: quorum(num_replicas),
            impossible_at: quorum_impossible(num_replicas),
            state: Mutex::new(TrackerState {
                acked: BTreeSet::new(),
                failed: BTreeSet::new(),
                highest_accepted: None,
                decision: None,
                notify: Some(tx),
            }),
        };
        (tracker, rx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn decide(state: &mut TrackerState, decision: QuorumDecision) -> Option<QuorumDecision> {
        if state.decision.is_some() {
            return None;
        }
        state.decision = Some(decision);
        if let Some(tx) = state.notify.take() {
            let _ = tx.send(decision);
        }
        Some(decision)
    }

    /// Records an acknowledgement from `replica`, optionally carrying an
    /// accepted entry it already holds.
    ///
    /// Returns the decision if this call made it.
    pub fn ack(&self, replica: &str, accepted: Option<WalEntry>) -> Option<QuorumDecision> {
        let mut state = self.lock();
        if state.decision.is_some()
            || state.failed.contains(replica)
            || !state.acked.insert(replica.to_owned())
        {
            return None;
        }
        if let Some(entry) = accepted.filter(WalEntry::is_accepted)
            && state.highest_accepted.as_ref().is_none_or(|h| entry.n > h.n)
        {
            state.highest_accepted = Some(entry);
        }
        trace!(replica, acked = state.acked.len(), needed = self.needed, "ack");
        if state.acked.len() >= self.needed {
            Self::decide(&mut state, QuorumDecision::Reached)
        } else {
            None
        }
    }

    /// Records that `replica` will not acknowledge this phase.
    ///
    /// Returns the decision if this call made it.
    pub fn fail(&self, replica: &str) -> Option<QuorumDecision> {
        let mut state = self.lock();
        if state.decision.is_some()
            || state.acked.contains(replica)
            || !state.failed.insert(replica.to_owned())
        {
            return None;
        }
        trace!(replica, failed = state.failed.len(), "replica failed");
        if state.failed.len() >= self.impossible_at {
            Self::decide(&mut state, QuorumDecision::Impossible)
        } else {
            None
        }
    }

    /// Gives up waiting: decides [`QuorumDecision::Impossible`] unless a
    /// decision already exists, and returns the final decision.
    pub fn expire(&self) -> QuorumDecision {
        let mut state = self.lock();
        Self::decide(&mut state, QuorumDecision::Impossible);
        state.decision.unwrap_or(QuorumDecision::Impossible)
    }

    #[must_use]
    pub fn decision(&self) -> Option<QuorumDecision> {
        self.lock().decision
    }

    /// The highest-numbered accepted entry reported by any acking replica.
    #[must_use]
    pub fn highest_accepted(&self) -> Option<WalEntry> {
        self.lock().highest_accepted.clone()
    }

    #[must_use]
    pub fn acked(&self) -> usize {
        self.lock().acked.len()
    }

    #[must_use]
    pub fn failed(&self) -> usize {
        self.lock().failed.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;

    #[test]
    fn acks_are_idempotent_per_replica() {
        let (tracker, _rx) = QuorumTracker::new(3);
        assert_eq!(tracker.ack("a", None), None);
        assert_eq!(tracker.ack("a", None), None);
        assert_eq!(tracker.acked(), 1);
        assert_eq!(tracker.decision(), None);
    }

    #[tokio::test]
    async fn two_of_three_reach_quorum() {
        let (tracker, rx) = QuorumTracker::new(3);
        tracker.ack("a", None);
        assert_eq!(tracker.ack("b", None), Some(QuorumDecision::Reached));
        assert_eq!(rx.await.unwrap(), QuorumDecision::Reached);
        // the third replica is irrelevant once decided
        assert_eq!(tracker.fail("c"), None);
        assert_eq!(tracker.decision(), Some(QuorumDecision::Reached));
    }

    #[test]
    fn five_replicas_need_three_failures() {
        let (tracker, _rx) = QuorumTracker::new(5);
        tracker.ack("local", None);
        assert_eq!(tracker.fail("b"), None);
        assert_eq!(tracker.fail("c"), None);
        assert_eq!(tracker.decision(), None);
        assert_eq!(tracker.fail("d"), Some(QuorumDecision::Impossible));
        assert_eq!(tracker.ack("e", None), None);
        assert_eq!(tracker.decision(), Some(QuorumDecision::Impossible));
    }

    #[test]
    fn a_failed_replica_cannot_later_ack() {
        let (tracker, _rx) = QuorumTracker::new(3);
        tracker.fail("b");
        tracker.ack("a", None);
        assert_eq!(tracker.ack("b", None), None);
        assert_eq!(tracker.decision(), None);
    }

    #[test]
    fn late_replies_change_nothing() {
        let (tracker, _rx) = QuorumTracker::new(3);
        tracker.ack("a", None);
        tracker.ack("b", None);

        let late = WalEntry::accepted(9, Some(Bytes::from_static(b"late")));
        assert_eq!(tracker.ack("c", Some(late)), None);
        assert_eq!(tracker.fail("d"), None);
        assert_eq!(tracker.acked(), 2);
        assert_eq!(tracker.failed(), 0);
        assert_eq!(tracker.highest_accepted(), None);
    }

    #[test]
    fn keeps_highest_accepted_entry() {
        let (tracker, _rx) = QuorumTracker::new(5);
        let low = WalEntry::accepted(2, Some(Bytes::from_static(b"low")));
        let high = WalEntry::accepted(4, Some(Bytes::from_static(b"high")));
        tracker.ack("a", Some(low));
        tracker.ack("b", Some(high.clone()));
        tracker.ack("c", Some(WalEntry::promise(9)));
        assert_eq!(tracker.highest_accepted(), Some(high));
    }

    #[test]
    fn expire_only_decides_when_undecided() {
        let (tracker, _rx) = QuorumTracker::new(3);
        tracker.ack("a", None);
        tracker.ack("b", None);
        assert_eq!(tracker.expire(), QuorumDecision::Reached);

        let (tracker, _rx) = QuorumTracker::new(3);
        assert_eq!(tracker.expire(), QuorumDecision::Impossible);
    }

    #[test]
    fn concurrent_acks_decide_exactly_once() {
        for _ in 0..50 {
            let (tracker, _rx) = QuorumTracker::new(7);
            let tracker = Arc::new(tracker);
            let handles: Vec<_> = (0..7)
                .map(|i| {
                    let tracker = tracker.clone();
                    std::thread::spawn(move || {
                        if i % 2 == 0 {
                            tracker.ack(&format!("r{i}"), None)
                        } else {
                            tracker.fail(&format!("r{i}"))
                        }
                    })
                })
                .collect();
            let decisions: Vec<_> = handles
                .into_iter()
                .filter_map(|h| h.join().unwrap())
                .collect();
            assert_eq!(decisions.len(), 1);
        }
    }
}
