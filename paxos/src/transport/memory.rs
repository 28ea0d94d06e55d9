use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use error_stack::Report;
use meridian_core::ReplicationRequest;
use tokio::runtime::Handle;
use tracing::trace;

use super::{ReplicationTransport, ResponseHandler};
use crate::acceptor::ReplicaAcceptor;
use crate::error::TransportError;
use crate::store::CasStore;

/// In-process transport delivering straight to a [`ReplicaAcceptor`].
///
/// Can be made unreachable (sends refused) or held (sends accepted, replies
/// withheld until [`release`](Self::release)).
pub struct MemoryTransport<S> {
    acceptor: ReplicaAcceptor<S>,
    reachable: AtomicBool,
    hold: AtomicBool,
    held: Mutex<Vec<(ReplicationRequest, ResponseHandler)>>,
    sent: AtomicUsize,
}

impl<S: CasStore> MemoryTransport<S> {
    pub fn new(acceptor: ReplicaAcceptor<S>) -> Self {
        Self {
            acceptor,
            reachable: AtomicBool::new(true),
            hold: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            sent: AtomicUsize::new(0),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::SeqCst);
    }

    /// Number of requests handed off so far.
    #[must_use]
    pub fn sent(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Delivers every held request.
    pub fn release(&self) {
        let held = mem::take(&mut *self.held.lock().unwrap_or_else(PoisonError::into_inner));
        for (request, on_response) in held {
            self.deliver(request, on_response);
        }
    }

    fn deliver(&self, request: ReplicationRequest, on_response: ResponseHandler) {
        let acceptor = self.acceptor.clone();
        let Ok(runtime) = Handle::try_current() else {
            on_response(Err(Report::new(TransportError::Closed).attach("no runtime")));
            return;
        };
        runtime.spawn(async move {
            let result = tokio::task::spawn_blocking(move || acceptor.handle(&request)).await;
            match result {
                Ok(response) => on_response(Ok(response)),
                Err(err) => on_response(Err(
                    Report::new(TransportError::ConnectionLost).attach(err.to_string())
                )),
            }
        });
    }
}

impl<S: CasStore> ReplicationTransport for MemoryTransport<S> {
    fn send(&self, request: ReplicationRequest, on_response: ResponseHandler) -> bool {
        if !self.reachable.load(Ordering::SeqCst) || Handle::try_current().is_err() {
            return false;
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        trace!(slot = %request.slot(), "memory transport send");
        if self.hold.load(Ordering::SeqCst) {
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((request, on_response));
        } else {
            self.deliver(request, on_response);
        }
        true
    }
}
