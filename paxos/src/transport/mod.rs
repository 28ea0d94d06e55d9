//! Per-host channels to remote replicas.

mod memory;

use std::collections::HashMap;
use std::sync::Arc;

use error_stack::Report;
use meridian_core::{Host, ReplicationRequest, ReplicationResponse};

pub use memory::MemoryTransport;

use crate::error::TransportError;

/// Callback invoked once with the correlated response, or with the reason
/// none will arrive.
pub type ResponseHandler =
    Box<dyn FnOnce(Result<ReplicationResponse, Report<TransportError>>) + Send + 'static>;

/// A multiplexed channel to one remote host, shared by every attempt.
pub trait ReplicationTransport: Send + Sync + 'static {
    /// Hands `request` off for delivery.
    ///
    /// Returns `false`, without calling `on_response`, if the request could
    /// not be handed off. Once `true` is returned `on_response` is called at
    /// most once; a connection failure reports [`TransportError`] rather than
    /// dropping the handler silently.
    fn send(&self, request: ReplicationRequest, on_response: ResponseHandler) -> bool;
}

impl<T: ReplicationTransport + ?Sized> ReplicationTransport for Arc<T> {
    fn send(&self, request: ReplicationRequest, on_response: ResponseHandler) -> bool {
        (**self).send(request, on_response)
    }
}

/// Transports keyed by remote host.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    transports: HashMap<Host, Arc<dyn ReplicationTransport>>,
}

impl TransportRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, host: Host, transport: Arc<dyn ReplicationTransport>) {
        self.transports.insert(host, transport);
    }

    #[must_use]
    pub fn with(mut self, host: Host, transport: Arc<dyn ReplicationTransport>) -> Self {
        self.insert(host, transport);
        self
    }

    #[must_use]
    pub fn get(&self, host: &Host) -> Option<&Arc<dyn ReplicationTransport>> {
        self.transports.get(host)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }
}
