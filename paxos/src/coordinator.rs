//! Drives commit attempts through the Prepare, Accept and Respond stages.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use error_stack::Report;
use futures::FutureExt;
use meridian_core::{
    EntityGroup, EntryStatus, Host, ReplicationRequest, ReplicationResponse, Slot, Topology,
    WalEntry,
};
use rand::seq::SliceRandom;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::commit::{CommitHandle, CommitOutcome, CommitResolver};
use crate::config::{CoordinatorConfig, HighestSeenPlusOne, ProposalNumbers, Stage};
use crate::error::{AbortReason, CommitError, LogError, PipelineError};
use crate::log::LocalLog;
use crate::pipeline::{NextAction, PipelineExecutor, StageMachine};
use crate::quorum::{QuorumDecision, QuorumTracker};
use crate::store::CasStore;
use crate::transport::{ResponseHandler, TransportRegistry};

/// State of one commit, carried from stage to stage.
struct CommitAttempt {
    entity_group: EntityGroup,
    wal_index: Option<u64>,
    /// Whether `wal_index` was reserved from the group's cursor.
    reserved: bool,
    working: WalEntry,
    used_existing: bool,
    /// The phase `tracker` belongs to.
    phase: Stage,
    tracker: Option<Arc<QuorumTracker>>,
    superseded: bool,
    abort: Option<AbortReason>,
    resolver: CommitResolver,
}

impl CommitAttempt {
    fn slot(&self) -> Option<Slot> {
        self.wal_index.map(|wal_index| Slot {
            entity_group: self.entity_group.clone(),
            wal_index,
        })
    }

    fn committed(&self) -> bool {
        self.abort.is_none()
            && self.phase == Stage::Accept
            && self
                .tracker
                .as_ref()
                .is_some_and(|t| t.decision() == Some(QuorumDecision::Reached))
    }

    fn abort_with(&mut self, report: &Report<LogError>) -> NextAction<Stage> {
        warn!(?report, "local log operation failed; aborting");
        self.abort = Some((*report.current_context()).into());
        NextAction::Terminate
    }
}

#[derive(Default)]
struct GroupCursor {
    /// No index below this one is unaccepted, as far as this process knows.
    next: u64,
    in_flight: BTreeSet<u64>,
}

/// Hands out the next free log index per entity group.
#[derive(Default)]
struct IndexCursors {
    groups: Mutex<HashMap<EntityGroup, GroupCursor>>,
}

impl IndexCursors {
    /// Reserves the first index that holds no accepted entry and is not
    /// already claimed by an attempt in this process.
    fn reserve<S: CasStore>(
        &self,
        log: &LocalLog<S>,
        entity_group: &EntityGroup,
    ) -> Result<u64, Report<LogError>> {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        let cursor = groups.entry(entity_group.clone()).or_default();

        let mut index = log.first_unaccepted_index(entity_group, cursor.next)?;
        cursor.next = index;
        while cursor.in_flight.contains(&index) {
            index = log.first_unaccepted_index(entity_group, index + 1)?;
        }
        cursor.in_flight.insert(index);
        Ok(index)
    }

    fn release(&self, entity_group: &EntityGroup, index: u64) {
        let mut groups = self.groups.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cursor) = groups.get_mut(entity_group) {
            cursor.in_flight.remove(&index);
        }
    }
}

async fn blocking<T, F>(f: F) -> Result<T, Report<LogError>>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, Report<LogError>> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.unwrap_or_else(|err| {
        Err(Report::new(LogError::StorageUnavailable)
            .attach(format!("storage task failed: {err}")))
    })
}

fn response_handler(
    tracker: Arc<QuorumTracker>,
    replica: String,
    wal_index: u64,
) -> ResponseHandler {
    Box::new(move |result| match result {
        Ok(response) if response.wal_index() != wal_index => {
            warn!(
                replica,
                expected = wal_index,
                got = response.wal_index(),
                "response for wrong slot"
            );
            tracker.fail(&replica);
        }
        Ok(ReplicationResponse::PrepareAck { accepted, .. }) => {
            tracker.ack(&replica, accepted);
        }
        Ok(ReplicationResponse::AcceptAck { .. }) => {
            tracker.ack(&replica, None);
        }
        Ok(response) => {
            debug!(replica, ?response, "replica refused");
            tracker.fail(&replica);
        }
        Err(report) => {
            debug!(replica, ?report, "no response from replica");
            tracker.fail(&replica);
        }
    })
}

/// The stage logic behind [`ConsensusCoordinator`].
struct Phases<S> {
    log: Arc<LocalLog<S>>,
    topology: Topology,
    transports: TransportRegistry,
    proposals: Arc<dyn ProposalNumbers>,
    phase_timeout: Option<Duration>,
    cursors: Arc<IndexCursors>,
}

impl<S: CasStore> Phases<S> {
    fn new_tracker(
        &self,
        phase: Stage,
        attempt: &mut CommitAttempt,
    ) -> (Arc<QuorumTracker>, oneshot::Receiver<QuorumDecision>) {
        let (tracker, decided) = QuorumTracker::new(self.topology.num_replicas());
        let tracker = Arc::new(tracker);
        attempt.phase = phase;
        attempt.tracker = Some(tracker.clone());
        (tracker, decided)
    }

    /// Sends `request` to one host of every remote replica. A replica none of
    /// whose hosts takes the request counts as failed.
    fn fan_out(&self, tracker: &Arc<QuorumTracker>, request: &ReplicationRequest) {
        let wal_index = request.slot().wal_index;
        for replica in self.topology.remote_replicas() {
            let mut hosts: Vec<&Host> = replica.hosts.iter().collect();
            hosts.shuffle(&mut rand::rng());

            let dispatched = hosts.into_iter().any(|host| {
                let Some(transport) = self.transports.get(host) else {
                    trace!(%host, "no transport registered for host");
                    return false;
                };
                let handler = response_handler(tracker.clone(), replica.name.clone(), wal_index);
                let sent = transport.send(request.clone(), handler);
                trace!(%host, sent, "dispatch");
                sent
            });

            if !dispatched {
                warn!(replica = %replica.name, "no host accepted the request");
                tracker.fail(&replica.name);
            }
        }
    }

    /// Continues to `on_reached` once the tracker decides in favour, and to
    /// Respond otherwise, without holding a stage slot while waiting.
    fn await_decision(
        &self,
        tracker: Arc<QuorumTracker>,
        decided: oneshot::Receiver<QuorumDecision>,
        on_reached: Stage,
    ) -> NextAction<Stage> {
        match tracker.decision() {
            Some(QuorumDecision::Reached) => return NextAction::Advance(on_reached),
            Some(QuorumDecision::Impossible) => return NextAction::Advance(Stage::Respond),
            None => {}
        }

        let phase_timeout = self.phase_timeout;
        NextAction::Suspend(
            async move {
                let decision = match phase_timeout {
                    Some(limit) => tokio::time::timeout(limit, decided)
                        .await
                        .ok()
                        .and_then(Result::ok),
                    None => decided.await.ok(),
                };
                let decision = decision.unwrap_or_else(|| {
                    debug!("phase timed out waiting for quorum");
                    tracker.expire()
                });
                match decision {
                    QuorumDecision::Reached => on_reached,
                    QuorumDecision::Impossible => Stage::Respond,
                }
            }
            .boxed(),
        )
    }

    #[instrument(skip_all, fields(group = %attempt.entity_group, index = ?attempt.wal_index))]
    async fn prepare(&self, attempt: &mut CommitAttempt) -> NextAction<Stage> {
        let wal_index = match attempt.wal_index {
            Some(index) => index,
            None => {
                let log = self.log.clone();
                let cursors = self.cursors.clone();
                let group = attempt.entity_group.clone();
                match blocking(move || cursors.reserve(&log, &group)).await {
                    Ok(index) => {
                        attempt.wal_index = Some(index);
                        attempt.reserved = true;
                        index
                    }
                    Err(report) => return attempt.abort_with(&report),
                }
            }
        };
        let slot = Slot {
            entity_group: attempt.entity_group.clone(),
            wal_index,
        };

        let log = self.log.clone();
        let proposals = self.proposals.clone();
        let local_slot = slot.clone();
        let local = blocking(move || {
            let highest_seen = log.read(&local_slot)?.map(|entry| entry.n);
            let n = proposals.next_proposal_number(&local_slot, highest_seen);
            let existing = log.prepare_local(&local_slot, n)?;
            Ok((n, existing))
        })
        .await;
        let (n, existing) = match local {
            Ok(result) => result,
            Err(report) => return attempt.abort_with(&report),
        };
        attempt.working.n = n;

        let (tracker, decided) = self.new_tracker(Stage::Prepare, attempt);
        let me = self.topology.my_replica();
        if let Some(existing) = &existing
            && existing.n >= n
        {
            debug!(existing_n = existing.n, status = ?existing.status, "adopting existing entry");
            attempt.working = existing.clone();
            attempt.used_existing = true;
        }
        tracker.ack(me, existing);

        debug!(n = attempt.working.n, "prepare fan-out");
        let request = ReplicationRequest::Prepare {
            slot,
            n: attempt.working.n,
        };
        self.fan_out(&tracker, &request);
        self.await_decision(tracker, decided, Stage::Accept)
    }

    #[instrument(skip_all, fields(group = %attempt.entity_group, index = ?attempt.wal_index))]
    async fn accept(&self, attempt: &mut CommitAttempt) -> NextAction<Stage> {
        let Some(slot) = attempt.slot() else {
            warn!("accept reached without a slot");
            return NextAction::Terminate;
        };

        if let Some(highest) = attempt.tracker.as_ref().and_then(|t| t.highest_accepted())
            && highest.value != attempt.working.value
        {
            debug!(highest_n = highest.n, "adopting value accepted by a replica");
            if highest.n >= attempt.working.n {
                attempt.working = highest;
            } else {
                attempt.working.value = highest.value;
            }
            attempt.used_existing = true;
        }
        attempt.working.status = EntryStatus::Accepted;

        let log = self.log.clone();
        let entry = attempt.working.clone();
        let local_slot = slot.clone();
        let written = match blocking(move || log.accept_local(&local_slot, &entry)).await {
            Ok(written) => written,
            Err(report) => return attempt.abort_with(&report),
        };

        let (tracker, decided) = self.new_tracker(Stage::Accept, attempt);
        let me = self.topology.my_replica();
        if written {
            tracker.ack(me, None);
        } else {
            debug!("local replica rejected accept");
            attempt.superseded = true;
            tracker.fail(me);
        }

        let request = ReplicationRequest::Accept {
            slot,
            entry: attempt.working.clone(),
        };
        self.fan_out(&tracker, &request);
        self.await_decision(tracker, decided, Stage::Respond)
    }

    fn respond(attempt: &mut CommitAttempt) -> NextAction<Stage> {
        if !attempt.committed() && attempt.abort.is_none() {
            attempt.abort = Some(if attempt.superseded {
                AbortReason::Superseded
            } else {
                AbortReason::QuorumUnreachable
            });
        }
        NextAction::Terminate
    }
}

impl<S: CasStore> StageMachine for Phases<S> {
    type Stage = Stage;
    type Item = CommitAttempt;

    async fn run(&self, stage: Stage, attempt: &mut CommitAttempt) -> NextAction<Stage> {
        match stage {
            Stage::Prepare => self.prepare(attempt).await,
            Stage::Accept => self.accept(attempt).await,
            Stage::Respond => Self::respond(attempt),
        }
    }

    fn finish(&self, attempt: CommitAttempt) {
        let committed = attempt.committed();
        if attempt.reserved
            && let Some(index) = attempt.wal_index
        {
            self.cursors.release(&attempt.entity_group, index);
        }

        let slot = attempt.slot();
        debug!(
            slot = ?slot,
            committed,
            used_existing = attempt.used_existing,
            abort = ?attempt.abort,
            "commit resolved"
        );
        let outcome = CommitOutcome {
            committed,
            entry: slot.as_ref().map(|_| attempt.working.clone()),
            slot,
            used_existing: attempt.used_existing,
            abort: attempt.abort,
        };
        attempt.resolver.resolve(outcome);
    }
}

/// Commits values to the replicated log.
///
/// Each call to [`commit`](Self::commit) or [`commit_at`](Self::commit_at)
/// runs one Paxos round: a local and remote prepare, then a local and remote
/// accept, resolving the returned [`CommitHandle`] with whether a majority of
/// replicas accepted.
pub struct ConsensusCoordinator<S: CasStore> {
    executor: PipelineExecutor<Phases<S>>,
}

impl<S: CasStore> Clone for ConsensusCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
        }
    }
}

impl<S: CasStore> ConsensusCoordinator<S> {
    /// Must be called from within a tokio runtime.
    pub fn new(
        log: Arc<LocalLog<S>>,
        topology: Topology,
        transports: TransportRegistry,
        config: &CoordinatorConfig,
    ) -> Self {
        Self::with_proposal_numbers(log, topology, transports, config, HighestSeenPlusOne)
    }

    pub fn with_proposal_numbers(
        log: Arc<LocalLog<S>>,
        topology: Topology,
        transports: TransportRegistry,
        config: &CoordinatorConfig,
        proposals: impl ProposalNumbers,
    ) -> Self {
        let phases = Phases {
            log,
            topology,
            transports,
            proposals: Arc::new(proposals),
            phase_timeout: config.phase_timeout,
            cursors: Arc::default(),
        };
        Self {
            executor: PipelineExecutor::start(phases, config.stages()),
        }
    }

    pub fn log(&self) -> &Arc<LocalLog<S>> {
        &self.executor.machine().log
    }

    pub fn topology(&self) -> &Topology {
        &self.executor.machine().topology
    }

    /// Commits `value` at the next free index of `entity_group`.
    ///
    /// `timeout` bounds [`CommitHandle::wait_deadline`]; the attempt runs to
    /// completion regardless.
    ///
    /// # Errors
    /// [`CommitError::Overloaded`] if the Prepare stage's backlog is full.
    pub fn commit(
        &self,
        value: impl Into<Bytes>,
        entity_group: impl Into<EntityGroup>,
        timeout: Duration,
    ) -> Result<CommitHandle, Report<CommitError>> {
        self.submit(value.into(), entity_group.into(), None, timeout)
    }

    /// Commits `value` at exactly `slot`.
    ///
    /// # Errors
    /// [`CommitError::Overloaded`] if the Prepare stage's backlog is full.
    pub fn commit_at(
        &self,
        value: impl Into<Bytes>,
        slot: Slot,
        timeout: Duration,
    ) -> Result<CommitHandle, Report<CommitError>> {
        self.submit(value.into(), slot.entity_group, Some(slot.wal_index), timeout)
    }

    fn submit(
        &self,
        value: Bytes,
        entity_group: EntityGroup,
        wal_index: Option<u64>,
        timeout: Duration,
    ) -> Result<CommitHandle, Report<CommitError>> {
        let (handle, resolver) = CommitHandle::new(Instant::now() + timeout);
        let attempt = CommitAttempt {
            entity_group,
            wal_index,
            reserved: false,
            working: WalEntry {
                n: 0,
                value: Some(value),
                status: EntryStatus::Prepared,
            },
            used_existing: false,
            phase: Stage::Prepare,
            tracker: None,
            superseded: false,
            abort: None,
            resolver,
        };

        self.executor
            .enqueue(Stage::Prepare, attempt)
            .map_err(|report| {
                let overloaded = *report.current_context() == PipelineError::Overloaded;
                report
                    .change_context(CommitError::Overloaded)
                    .attach(if overloaded { "prepare backlog full" } else { "prepare stage missing" })
            })?;
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCasStore;

    #[test]
    fn cursor_skips_accepted_and_in_flight_indexes() {
        let log = LocalLog::new(MemoryCasStore::new());
        let group = EntityGroup::from("eg");
        log.accept_local(&Slot::new(group.clone(), 0), &WalEntry::accepted(1, None))
            .unwrap();

        let cursors = IndexCursors::default();
        assert_eq!(cursors.reserve(&log, &group).unwrap(), 1);
        assert_eq!(cursors.reserve(&log, &group).unwrap(), 2);

        cursors.release(&group, 1);
        assert_eq!(cursors.reserve(&log, &group).unwrap(), 1);

        log.accept_local(&Slot::new(group.clone(), 1), &WalEntry::accepted(1, None))
            .unwrap();
        cursors.release(&group, 1);
        cursors.release(&group, 2);
        assert_eq!(cursors.reserve(&log, &group).unwrap(), 2);
    }

    #[test]
    fn cursors_are_per_group() {
        let log = LocalLog::new(MemoryCasStore::new());
        let cursors = IndexCursors::default();
        assert_eq!(cursors.reserve(&log, &EntityGroup::from("a")).unwrap(), 0);
        assert_eq!(cursors.reserve(&log, &EntityGroup::from("b")).unwrap(), 0);
    }
}
