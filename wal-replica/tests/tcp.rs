use std::time::Duration;

use meridian_core::{Host, ReplicaDesc, Slot, Topology};
use meridian_paxos::{AbortReason, BackoffConfig, CoordinatorConfig, MemoryCasStore};
use meridian_replica::Node;
use tokio::net::TcpListener;

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() -> impl Sized {
    use tracing::Dispatch;
    use tracing_subscriber::fmt::format::FmtSpan;
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("meridian_paxos=debug,meridian_replica=debug")
            }),
        )
        .with_span_events(FmtSpan::CLOSE)
        .with_test_writer()
        .finish();

    let dispatch = Dispatch::new(subscriber);
    tracing::dispatcher::set_default(&dispatch)
}

fn backoff() -> BackoffConfig {
    BackoffConfig {
        initial: Duration::from_millis(20),
        max: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

fn config() -> CoordinatorConfig {
    CoordinatorConfig::default().with_phase_timeout(Some(Duration::from_secs(5)))
}

fn topology(me: &str, ports: &[(&str, u16)]) -> Topology {
    Topology::new(
        me,
        ports
            .iter()
            .map(|(name, port)| ReplicaDesc::new(*name, [Host::new("127.0.0.1", *port)])),
    )
    .unwrap()
}

async fn listener() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

async fn cluster() -> Vec<Node<MemoryCasStore>> {
    let names = ["dc1", "dc2", "dc3"];
    let mut listeners = Vec::new();
    for _ in names {
        listeners.push(listener().await);
    }
    let ports: Vec<(&str, u16)> = names
        .iter()
        .zip(&listeners)
        .map(|(name, (_, port))| (*name, *port))
        .collect();

    names
        .iter()
        .zip(listeners)
        .map(|(name, (listener, _))| {
            Node::start(
                MemoryCasStore::new(),
                topology(name, &ports),
                listener,
                &config(),
                &backoff(),
            )
            .unwrap()
        })
        .collect()
}

async fn wait_accepted(node: &Node<MemoryCasStore>, slot: &Slot) {
    tokio::time::timeout(WAIT, async {
        loop {
            if let Some(entry) = node.log().read(slot).unwrap()
                && entry.is_accepted()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commits_across_three_nodes() {
    let _guard = init_tracing();
    let nodes = cluster().await;

    let handle = nodes[0]
        .coordinator()
        .commit(&b"hello"[..], "users", WAIT)
        .unwrap();
    assert!(handle.wait_timeout(WAIT).await.unwrap());

    let outcome = handle.outcome().unwrap();
    let slot = outcome.slot.unwrap();
    assert_eq!(slot, Slot::new("users", 0));
    assert!(!outcome.used_existing);

    for node in &nodes {
        wait_accepted(node, &slot).await;
        let entry = node.log().read(&slot).unwrap().unwrap();
        assert_eq!(entry.value.as_deref(), Some(&b"hello"[..]));
    }

    // the next commit from another replica lands on the following index
    let handle = nodes[1]
        .coordinator()
        .commit(&b"world"[..], "users", WAIT)
        .unwrap();
    assert!(handle.wait_timeout(WAIT).await.unwrap());
    assert_eq!(handle.outcome().unwrap().slot, Some(Slot::new("users", 1)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_peers_abort() {
    let _guard = init_tracing();

    // reserve ports nobody listens on
    let (dead2, port2) = listener().await;
    let (dead3, port3) = listener().await;
    drop((dead2, dead3));

    let (local, port1) = listener().await;
    let node = Node::start(
        MemoryCasStore::new(),
        topology("dc1", &[("dc1", port1), ("dc2", port2), ("dc3", port3)]),
        local,
        &config(),
        &backoff(),
    )
    .unwrap();

    let handle = node
        .coordinator()
        .commit(&b"lonely"[..], "users", WAIT)
        .unwrap();
    assert!(!handle.wait_timeout(WAIT).await.unwrap());
    assert_eq!(
        handle.outcome().unwrap().abort,
        Some(AbortReason::QuorumUnreachable)
    );
}
