use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use v6_coordinator::{routes::build_routes, CleanupPolicy, Coordinator};

/// Coordinator process: task/run state machine, socket dispatcher,
/// session/dataframe orchestrator.
#[derive(Debug, Parser)]
#[command(name = "v6-coordinatord")]
struct Args {
    #[arg(long, default_value = "0.0.0.0:7601")]
    listen: SocketAddr,

    #[arg(long, env = "V6_JWT_SECRET")]
    jwt_secret: String,

    #[arg(long, default_value_t = 30)]
    runs_data_cleanup_days: i64,

    #[arg(long, default_value_t = 3600)]
    cleanup_interval_seconds: u64,

    /// Also clear a run's `input` once its result ages out, not just the
    /// result itself.
    #[arg(long, default_value_t = false)]
    delete_input_on_cleanup: bool,

    /// Route run results through the `/blobstream` external-storage path
    /// instead of inline PATCH bodies.
    #[arg(long, default_value_t = false)]
    blob_store_enabled: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    simple_logger::init_with_level(log::Level::Info).expect("failed to init logger");
    let args = Args::parse();

    let coordinator = Coordinator::new(
        args.jwt_secret.as_bytes(),
        CleanupPolicy {
            runs_data_cleanup_days: args.runs_data_cleanup_days,
            delete_input_on_cleanup: args.delete_input_on_cleanup,
        },
        args.blob_store_enabled,
    );

    tokio::spawn(v6_coordinator::cleanup::run(
        coordinator.clone(),
        Duration::from_secs(args.cleanup_interval_seconds),
    ));

    let app = build_routes(coordinator);
    log::info!("coordinator listening on {}", args.listen);
    let listener = tokio::net::TcpListener::bind(args.listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
