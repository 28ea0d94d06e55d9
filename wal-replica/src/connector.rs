//! Outbound replication connections.
//!
//! A [`TcpTransport`] owns one connection to one remote host and multiplexes
//! every in-flight request over it, pairing responses to requests by
//! correlation id.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use error_stack::{Report, ResultExt};
use futures::{SinkExt, StreamExt};
use meridian_core::{
    Envelope, Host, HostContext, ReplicationRequest, ReplicationResponse, WireCodec,
};
use meridian_paxos::{BackoffConfig, ReplicationTransport, ResponseHandler, TransportError};
use rand::SeedableRng;
use rand::rngs::StdRng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, trace, warn};

const OUTBOUND_CAPACITY: usize = 1024;

const CONNECTING: u8 = 0;
const CONNECTED: u8 = 1;
const DOWN: u8 = 2;

/// Opens byte streams to remote hosts.
pub trait Dialer: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    fn dial(&self, host: &Host) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// Plain TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDialer;

impl Dialer for TokioDialer {
    type Stream = TcpStream;

    async fn dial(&self, host: &Host) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host.name.as_str(), host.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

#[derive(Default)]
struct Shared {
    state: AtomicU8,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, ResponseHandler>>,
}

impl Shared {
    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ResponseHandler>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, envelope: Envelope<ReplicationResponse>) {
        let handler = self.pending().remove(&envelope.correlation);
        match handler {
            Some(handler) => handler(Ok(envelope.message)),
            None => trace!(correlation = envelope.correlation, "response for unknown request"),
        }
    }

    fn fail(&self, correlation: u64, error: TransportError) {
        let handler = self.pending().remove(&correlation);
        if let Some(handler) = handler {
            handler(Err(Report::new(error)));
        }
    }

    fn fail_all(&self, error: TransportError) {
        let pending = mem::take(&mut *self.pending());
        if !pending.is_empty() {
            debug!(count = pending.len(), %error, "failing in-flight requests");
        }
        for handler in pending.into_values() {
            handler(Err(Report::new(error)));
        }
    }
}

/// [`ReplicationTransport`] over a reconnecting stream to one host.
///
/// Requests are queued while the first connection is being made. After a
/// connection fails, sends are refused until a reconnect succeeds.
pub struct TcpTransport {
    host: Host,
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Envelope<ReplicationRequest>>,
}

impl TcpTransport {
    /// Connects over plain TCP. Must be called from within a tokio runtime.
    #[must_use]
    pub fn connect_tcp(host: Host, backoff: BackoffConfig) -> Self {
        Self::connect(host, TokioDialer, backoff)
    }

    /// Spawns the connection task. Must be called from within a tokio runtime.
    pub fn connect<D: Dialer>(host: Host, dialer: D, backoff: BackoffConfig) -> Self {
        let shared = Arc::new(Shared::default());
        let (outbound, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        tokio::spawn(run_connection(
            host.clone(),
            dialer,
            backoff,
            shared.clone(),
            rx,
        ));
        Self {
            host,
            shared,
            outbound,
        }
    }

    #[must_use]
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Whether sends are currently refused.
    #[must_use]
    pub fn is_down(&self) -> bool {
        self.shared.state.load(Ordering::SeqCst) == DOWN
    }
}

impl ReplicationTransport for TcpTransport {
    fn send(&self, request: ReplicationRequest, on_response: ResponseHandler) -> bool {
        if self.is_down() {
            return false;
        }
        let correlation = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        // registered under the lock, so neither a response nor a connection
        // failure can reach the handler before the send is known to succeed
        let mut pending = self.shared.pending();
        if self
            .outbound
            .try_send(Envelope::new(correlation, request))
            .is_err()
        {
            trace!(host = %self.host, "outbound queue full or closed");
            return false;
        }
        pending.insert(correlation, on_response);
        true
    }
}

#[instrument(skip_all, name = "replication_connection", fields(%host))]
async fn run_connection<D: Dialer>(
    host: Host,
    dialer: D,
    backoff: BackoffConfig,
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<Envelope<ReplicationRequest>>,
) {
    let mut rng = StdRng::from_os_rng();
    let mut retries = 0u32;

    loop {
        match dialer.dial(&host).await {
            Ok(stream) => {
                retries = 0;
                shared.state.store(CONNECTED, Ordering::SeqCst);
                debug!("connected");
                match pump(stream, &shared, &mut rx).await {
                    Ok(()) => {
                        debug!("transport dropped; closing connection");
                        shared.fail_all(TransportError::Closed);
                        return;
                    }
                    Err(report) => warn!(?report, "connection lost"),
                }
            }
            Err(err) => {
                let report = Report::new(err)
                    .change_context(TransportError::ConnectionLost)
                    .attach(HostContext::new(&host));
                warn!(?report, "connect failed");
            }
        }

        shared.state.store(DOWN, Ordering::SeqCst);
        shared.fail_all(TransportError::ConnectionLost);
        loop {
            match rx.try_recv() {
                Ok(envelope) => shared.fail(envelope.correlation, TransportError::ConnectionLost),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => return,
            }
        }

        let delay = backoff.duration(retries, &mut rng);
        retries = retries.saturating_add(1);
        trace!(?delay, "reconnecting after backoff");
        tokio::time::sleep(delay).await;
        shared.state.store(CONNECTING, Ordering::SeqCst);
    }
}

/// Moves frames until the connection breaks (`Err`) or the transport is
/// dropped (`Ok`).
async fn pump<S>(
    stream: S,
    shared: &Shared,
    rx: &mut mpsc::Receiver<Envelope<ReplicationRequest>>,
) -> Result<(), Report<TransportError>>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (read, write) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read, WireCodec::<Envelope<ReplicationResponse>>::new());
    let mut writer = FramedWrite::new(write, WireCodec::<Envelope<ReplicationRequest>>::new());

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(envelope) = outbound else {
                    return Ok(());
                };
                trace!(correlation = envelope.correlation, "send");
                writer
                    .send(envelope)
                    .await
                    .change_context(TransportError::ConnectionLost)?;
            }
            inbound = reader.next() => match inbound {
                Some(Ok(envelope)) => shared.complete(envelope),
                Some(Err(err)) => {
                    return Err(Report::new(err).change_context(TransportError::ConnectionLost));
                }
                None => {
                    return Err(Report::new(TransportError::ConnectionLost)
                        .attach("peer closed the connection"));
                }
            },
        }
    }
}
