use std::time::Duration;

use clap::Parser;
use mini_mapreduce::mr::apps;
use mini_mapreduce::mr::rpc::{socket_path, CoordinatorServiceClient, TaskAssignment};
use mini_mapreduce::mr::worker::{run_map, run_reduce, RETRY_BACKOFF_MS};
use tarpc::{client, context, tokio_serde::formats::Json};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Poll the coordinator for map or reduce work, run it, and report
/// completion, until the coordinator is unreachable.
#[derive(Parser, Debug)]
#[command(name = "mrworker")]
struct Args {
    /// The compiled-in Map/Reduce application to run.
    #[arg(long, default_value = "wc")]
    app: String,
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
    let (map_fn, reduce_fn) = apps::lookup(&args.app)
        .ok_or_else(|| anyhow::anyhow!("unknown application {:?}", args.app))?;

    let sock = socket_path();
    let transport = match tarpc::serde_transport::unix::connect(&sock, Json::default).await {
        Ok(t) => t,
        Err(e) => {
            info!(socket = ?sock, error = %e, "coordinator unreachable, exiting");
            return Ok(());
        }
    };
    let client = CoordinatorServiceClient::new(client::Config::default(), transport).spawn();

    loop {
        let assignment = match client.get_task(context::current()).await {
            Ok(a) => a,
            Err(e) => {
                info!(error = %e, "coordinator did not reply, exiting");
                return Ok(());
            }
        };

        match assignment {
            TaskAssignment::Map {
                file,
                map_id,
                n_reduce,
            } => {
                info!(file = %file, map_id, "received map task");
                let file_for_completion = file.clone();
                let result =
                    tokio::task::spawn_blocking(move || run_map(map_id, &file, n_reduce, map_fn))
                        .await
                        .expect("map task panicked");
                match result {
                    Ok(()) => {
                        if let Err(e) = client
                            .complete_map_task(context::current(), file_for_completion)
                            .await
                        {
                            warn!(error = %e, "failed to report map completion");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "map task failed, letting the lease expire");
                    }
                }
            }
            TaskAssignment::Reduce { reduce_id } => {
                info!(reduce_id, "received reduce task");
                let result = tokio::task::spawn_blocking(move || run_reduce(reduce_id, reduce_fn))
                    .await
                    .expect("reduce task panicked");
                match result {
                    Ok(()) => {
                        if let Err(e) = client
                            .complete_reduce_task(context::current(), reduce_id)
                            .await
                        {
                            warn!(error = %e, "failed to report reduce completion");
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "reduce task failed, letting the lease expire");
                    }
                }
            }
            TaskAssignment::Retry => {
                sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            }
        }
    }
}
