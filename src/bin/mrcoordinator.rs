use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use futures::StreamExt;
use mini_mapreduce::mr::coordinator::Coordinator;
use mini_mapreduce::mr::rpc::socket_path;
use tarpc::{server::incoming::Incoming, tokio_serde::formats::Json};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Coordinate a one-host MapReduce job: lease map tasks over `files`, then
/// reduce tasks over `--reduce` partitions, until every input has been
/// mapped and every partition has been reduced.
#[derive(Parser, Debug)]
#[command(name = "mrcoordinator")]
struct Args {
    /// Input file paths, one map task per file.
    #[arg(required = true)]
    files: Vec<String>,

    /// Number of reduce partitions.
    #[arg(short = 'n', long, default_value_t = 10)]
    reduce: u32,

    /// Seconds a lease may sit in-progress before it is reclaimed.
    #[arg(long = "worker-timeout-secs", default_value_t = 10)]
    worker_timeout_secs: u64,

    /// How often the expiration sweeper walks the registries.
    #[arg(long = "lease-check-secs", default_value_t = 1)]
    lease_check_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(
        files = args.files.len(),
        reduce = args.reduce,
        "starting coordinator"
    );

    let sock = socket_path();
    if sock.exists() {
        std::fs::remove_file(&sock)
            .with_context(|| format!("removing stale socket at {sock:?}"))?;
    }

    // Bind failure is fatal: there is nothing useful left for the driver to do.
    let listener = tarpc::serde_transport::unix::listen(&sock, Json::default)
        .await
        .with_context(|| format!("binding coordinator socket at {sock:?}"))?;
    info!(socket = ?sock, "listening for worker connections");

    let coordinator = Coordinator::new(args.files, args.reduce);

    // The driver's event loop multiplexes two channels: expired-lease
    // notifications from the sweeper (informational) and a fatal
    // server-error channel fed by the RPC accept loop, matching §5's
    // "single mutex + channels" design.
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);
    {
        let coordinator = coordinator.clone();
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            listener
                .filter_map(|r| async { r.ok() })
                .map(tarpc::server::BaseChannel::with_defaults)
                .execute(coordinator.serve())
                .await;
            // `execute` only returns if the accept stream itself ended, i.e.
            // the listener died.
            let _ = err_tx
                .send(anyhow::anyhow!("coordinator RPC listener terminated unexpectedly"))
                .await;
        });
    }

    let mut expired_rx =
        coordinator.spawn_expiration_sweeper(
            Duration::from_secs(args.lease_check_secs),
            Duration::from_secs(args.worker_timeout_secs),
        );

    let mut done_check = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = done_check.tick() => {
                if coordinator.done() {
                    break;
                }
            }
            Some(expired) = expired_rx.recv() => {
                info!(?expired, "reclaimed expired leases");
            }
            Some(err) = err_rx.recv() => {
                error!(%err, "fatal coordinator server error");
                return Err(err);
            }
        }
    }

    info!("all map and reduce tasks complete; coordinator exiting");
    Ok(())
}
