//! Meridian replica server
//!
//! Serves this replica's copy of the log and proposes commits to the others.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use error_stack::{Report, ResultExt};
use meridian_core::Topology;
use meridian_paxos::{BackoffConfig, CoordinatorConfig};
use meridian_replica::{FjallCasStore, Node};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(about = "Replicated write-ahead log over Paxos")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replica
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Path to the database directory
    #[arg(short, long, default_value = "./meridian-db")]
    database: PathBuf,

    /// Path to the topology JSON file
    #[arg(short, long)]
    topology: PathBuf,

    /// Bind address for the replication server
    #[arg(short, long, default_value = "0.0.0.0:7400")]
    bind: String,

    /// How long each phase waits for a quorum decision; 0 waits indefinitely
    #[arg(long, default_value_t = 30_000, env = "MERIDIAN_PHASE_TIMEOUT_MS")]
    phase_timeout_ms: u64,

    /// Commit `<entity-group> <value>` lines read from stdin
    #[arg(long)]
    stdin: bool,
}

#[derive(Debug)]
struct CliError;

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("meridian failed")
    }
}

impl std::error::Error for CliError {}

const STDIN_COMMIT_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Report<CliError>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Command::Serve(args) = Cli::parse().command;
    serve(args).await
}

async fn serve(args: ServeArgs) -> Result<(), Report<CliError>> {
    let topology = Topology::load(&args.topology).change_context(CliError)?;
    info!(
        replica = topology.my_replica(),
        replicas = topology.num_replicas(),
        "loaded topology"
    );

    info!(path = ?args.database, "opening database");
    let store = FjallCasStore::open(&args.database)
        .await
        .change_context(CliError)?;

    let listener = TcpListener::bind(&args.bind)
        .await
        .change_context(CliError)
        .attach_with(|| format!("binding {}", args.bind))?;

    let phase_timeout =
        (args.phase_timeout_ms > 0).then(|| Duration::from_millis(args.phase_timeout_ms));
    let config = CoordinatorConfig::default().with_phase_timeout(phase_timeout);
    let node = Node::start(store, topology, listener, &config, &BackoffConfig::default())
        .change_context(CliError)?;
    info!(addr = %node.local_addr(), "replica listening");

    if args.stdin {
        commit_lines(&node).await?;
        return Ok(());
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.change_context(CliError).attach("waiting for ctrl-c")?;
            info!("shutting down");
            Ok(())
        }
        result = node.join() => result.change_context(CliError),
    }
}

/// Commits each `<entity-group> <value>` line and prints the result.
async fn commit_lines(node: &Node<FjallCasStore>) -> Result<(), Report<CliError>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.change_context(CliError)? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((entity_group, value)) = line.split_once(char::is_whitespace) else {
            warn!(line, "expected `<entity-group> <value>`");
            continue;
        };

        let handle = match node.coordinator().commit(
            value.trim().to_owned(),
            entity_group,
            STDIN_COMMIT_TIMEOUT,
        ) {
            Ok(handle) => handle,
            Err(report) => {
                warn!(?report, "commit rejected");
                continue;
            }
        };

        let reply = match handle.wait_deadline().await {
            Ok(_) => match handle.outcome() {
                Some(outcome) if outcome.committed => {
                    let slot = outcome.slot.map(|s| s.to_string()).unwrap_or_default();
                    if outcome.used_existing {
                        format!("committed existing entry at {slot}\n")
                    } else {
                        format!("committed {slot}\n")
                    }
                }
                Some(outcome) => match outcome.abort {
                    Some(reason) => format!("aborted: {reason}\n"),
                    None => "aborted\n".to_owned(),
                },
                None => "aborted\n".to_owned(),
            },
            Err(_) => "timed out\n".to_owned(),
        };
        stdout
            .write_all(reply.as_bytes())
            .await
            .change_context(CliError)?;
        stdout.flush().await.change_context(CliError)?;
    }
    Ok(())
}
