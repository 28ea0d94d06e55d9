//! Inbound replication connections.

use std::fmt;
use std::net::SocketAddr;

use error_stack::{Report, ResultExt};
use futures::{SinkExt, StreamExt};
use meridian_core::{Envelope, ReplicationRequest, ReplicationResponse, WireCodec};
use meridian_paxos::{CasStore, ReplicaAcceptor};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, trace, warn};

/// Marker error for the replica server.
#[derive(Debug)]
pub struct ServerError;

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("replica server failed")
    }
}

impl std::error::Error for ServerError {}

const RESPONSE_QUEUE: usize = 256;

/// Accepts connections forever, serving each on its own task.
///
/// # Errors
/// Returns only if accepting a connection fails.
pub async fn serve<S: CasStore>(
    listener: TcpListener,
    acceptor: ReplicaAcceptor<S>,
) -> Result<(), Report<ServerError>> {
    loop {
        let (stream, peer) = listener
            .accept()
            .await
            .change_context(ServerError)
            .attach("accepting connection")?;
        if let Err(err) = stream.set_nodelay(true) {
            trace!(%err, "failed to set nodelay");
        }
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            if let Err(report) = serve_connection(stream, peer, acceptor).await {
                warn!(?report, %peer, "connection ended with error");
            }
        });
    }
}

/// Answers requests from one connection until the peer hangs up.
///
/// Requests are applied concurrently; each response goes back tagged with
/// its request's correlation id, in completion order.
///
/// # Errors
/// Fails on a malformed frame or an I/O error.
#[instrument(skip_all, name = "replica_connection", fields(%peer))]
pub async fn serve_connection<IO, S>(
    io: IO,
    peer: SocketAddr,
    acceptor: ReplicaAcceptor<S>,
) -> Result<(), Report<ServerError>>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
    S: CasStore,
{
    debug!("accepted connection");
    let (read, write) = tokio::io::split(io);
    let mut requests = FramedRead::new(read, WireCodec::<Envelope<ReplicationRequest>>::new());
    let mut responses =
        FramedWrite::new(write, WireCodec::<Envelope<ReplicationResponse>>::new());

    let (tx, mut rx) = mpsc::channel::<Envelope<ReplicationResponse>>(RESPONSE_QUEUE);
    let writer = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            trace!(correlation = envelope.correlation, "respond");
            responses
                .send(envelope)
                .await
                .change_context(ServerError)
                .attach("writing response")?;
        }
        Ok::<_, Report<ServerError>>(())
    });

    let result = loop {
        let Some(frame) = requests.next().await else {
            break Ok(());
        };
        let envelope = match frame
            .change_context(ServerError)
            .attach("reading request")
        {
            Ok(envelope) => envelope,
            Err(report) => break Err(report),
        };
        trace!(correlation = envelope.correlation, slot = %envelope.message.slot(), "request");

        let acceptor = acceptor.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let Envelope {
                correlation,
                message,
            } = envelope;
            match tokio::task::spawn_blocking(move || acceptor.handle(&message)).await {
                Ok(response) => {
                    let _ = tx.send(Envelope::new(correlation, response)).await;
                }
                Err(err) => warn!(%err, correlation, "request handler panicked"),
            }
        });
    };

    drop(tx);
    let written = writer
        .await
        .change_context(ServerError)
        .attach("response writer task failed")?;
    debug!("connection closed");
    result.and(written)
}
