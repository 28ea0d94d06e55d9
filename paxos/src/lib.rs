//! Cross-datacenter Paxos commit engine over a CAS-protected write-ahead log.
//!
//! # Architecture
//!
//! - [`LocalLog`]: the local replica's slots, guarded by compare-and-swap on
//!   the proposal number
//! - [`ReplicationTransport`]: per-host channels to remote replicas
//! - [`QuorumTracker`]: counts replica acks and decides reached/impossible
//! - [`PipelineExecutor`]: bounded stages connected by continuation decisions
//! - [`ConsensusCoordinator`]: the Prepare, Accept and Respond stages
//! - [`CommitHandle`]: the awaitable result returned to callers
//!
//! # Quick Start
//!
//! ```ignore
//! let log = Arc::new(LocalLog::new(store));
//! let coordinator = ConsensusCoordinator::new(log, topology, transports, &CoordinatorConfig::default());
//! let handle = coordinator.commit(b"value".as_slice(), "users", Duration::from_secs(5))?;
//! if handle.wait().await {
//!     // a majority of replicas accepted
//! }
//! ```

#![warn(clippy::pedantic)]

pub mod acceptor;
pub mod commit;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod log;
pub mod pipeline;
pub mod quorum;
pub mod store;
pub mod transport;

pub use acceptor::ReplicaAcceptor;
pub use commit::{CommitHandle, CommitOutcome};
pub use config::{BackoffConfig, CoordinatorConfig, Fixed, HighestSeenPlusOne, ProposalNumbers, Stage};
pub use coordinator::ConsensusCoordinator;
pub use error::{
    AbortReason, CommitError, LogError, PipelineError, StorageError, TimedOut, TransportError,
};
pub use log::{LocalLog, MAX_ACCEPT_TRIES, MAX_PREPARE_TRIES};
pub use pipeline::{NextAction, PipelineExecutor, StageConfig, StageMachine};
pub use quorum::{QuorumDecision, QuorumTracker};
pub use store::{CasStore, MemoryCasStore, StoredRow};
pub use transport::{MemoryTransport, ReplicationTransport, ResponseHandler, TransportRegistry};
