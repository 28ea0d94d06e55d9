//! Wires one replica together: local log, replica server, transports to the
//! other replicas and the commit coordinator.

use std::net::SocketAddr;
use std::sync::Arc;

use error_stack::{Report, ResultExt};
use meridian_core::Topology;
use meridian_paxos::{
    BackoffConfig, CasStore, ConsensusCoordinator, CoordinatorConfig, LocalLog, ReplicaAcceptor,
    TransportRegistry,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::info;

use crate::connector::TcpTransport;
use crate::server::{ServerError, serve};

/// A running replica. Dropping it stops the replica server.
pub struct Node<S: CasStore> {
    coordinator: ConsensusCoordinator<S>,
    local_addr: SocketAddr,
    server: JoinHandle<Result<(), Report<ServerError>>>,
}

impl<S: CasStore> Node<S> {
    /// Starts serving on `listener` and connecting to every remote host in
    /// `topology`. Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Fails if the listener's address cannot be read.
    pub fn start(
        store: S,
        topology: Topology,
        listener: TcpListener,
        config: &CoordinatorConfig,
        backoff: &BackoffConfig,
    ) -> Result<Self, Report<ServerError>> {
        let local_addr = listener
            .local_addr()
            .change_context(ServerError)
            .attach("reading listener address")?;

        let log = Arc::new(LocalLog::new(store));
        let server = tokio::spawn(serve(listener, ReplicaAcceptor::new(log.clone())));

        let mut transports = TransportRegistry::new();
        for (replica, host) in topology.remote_hosts() {
            info!(replica = %replica.name, %host, "adding transport");
            transports.insert(
                host.clone(),
                Arc::new(TcpTransport::connect_tcp(host.clone(), backoff.clone())),
            );
        }

        info!(
            replica = topology.my_replica(),
            replicas = topology.num_replicas(),
            %local_addr,
            "node started"
        );
        let coordinator = ConsensusCoordinator::new(log, topology, transports, config);

        Ok(Self {
            coordinator,
            local_addr,
            server,
        })
    }

    pub fn coordinator(&self) -> &ConsensusCoordinator<S> {
        &self.coordinator
    }

    pub fn log(&self) -> &Arc<LocalLog<S>> {
        self.coordinator.log()
    }

    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the replica server to stop.
    ///
    /// # Errors
    /// Returns the server's error, if it failed.
    pub async fn join(mut self) -> Result<(), Report<ServerError>> {
        (&mut self.server)
            .await
            .change_context(ServerError)
            .attach("server task failed")?
    }
}

impl<S: CasStore> Drop for Node<S> {
    fn drop(&mut self) {
        self.server.abort();
    }
}
