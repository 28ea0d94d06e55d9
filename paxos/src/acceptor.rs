//! Applies replication requests from remote coordinators to the local log.

use std::sync::Arc;

use meridian_core::{ReplicationRequest, ReplicationResponse};
use tracing::{debug, warn};

use crate::log::LocalLog;
use crate::store::CasStore;

/// Server-side half of the replication protocol.
///
/// [`handle`](Self::handle) blocks on storage; run it on a blocking thread.
pub struct ReplicaAcceptor<S> {
    log: Arc<LocalLog<S>>,
}

impl<S> Clone for ReplicaAcceptor<S> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
        }
    }
}

impl<S: CasStore> ReplicaAcceptor<S> {
    pub fn new(log: Arc<LocalLog<S>>) -> Self {
        Self { log }
    }

    #[must_use]
    pub fn handle(&self, request: &ReplicationRequest) -> ReplicationResponse {
        let slot = request.slot();
        let wal_index = slot.wal_index;
        match request {
            ReplicationRequest::Prepare { n, .. } => match self.log.prepare_local(slot, *n) {
                Ok(None) => ReplicationResponse::PrepareAck {
                    wal_index,
                    n: *n,
                    accepted: None,
                },
                Ok(Some(existing)) if existing.is_accepted() => {
                    debug!(%slot, existing_n = existing.n, "prepare reports accepted entry");
                    ReplicationResponse::PrepareAck {
                        wal_index,
                        n: *n,
                        accepted: Some(existing),
                    }
                }
                Ok(Some(existing)) => ReplicationResponse::PrepareNack {
                    wal_index,
                    promised: existing.n,
                },
                Err(report) => {
                    warn!(%slot, ?report, "remote prepare failed");
                    ReplicationResponse::Failed { wal_index }
                }
            },
            ReplicationRequest::Accept { entry, .. } => match self.log.accept_local(slot, entry) {
                Ok(true) => ReplicationResponse::AcceptAck {
                    wal_index,
                    n: entry.n,
                },
                Ok(false) => ReplicationResponse::AcceptNack {
                    wal_index,
                    n: entry.n,
                },
                Err(report) => {
                    warn!(%slot, ?report, "remote accept failed");
                    ReplicationResponse::Failed { wal_index }
                }
            },
        }
    }
}
