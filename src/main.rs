use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ratesync::cli::{self, Role};
use ratesync::supervisor::{ProcessSpawner, Supervisor};
use ratesync::worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the relay pipe in worker processes
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ratesync=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse args and env vars
    let args = cli::Cli::parse();
    let role = args.role();
    let settings = args.into_settings()?;

    match role {
        Role::Worker { id, slot } => worker::run(settings, id, slot).await?,
        Role::Supervisor => {
            info!(
                "Starting {} {} with {} workers on {} (sync: {})",
                cli::APP_NAME,
                cli::APP_VERSION,
                settings.workers,
                settings.listen_socket_addr(),
                settings.topology
            );
            let spawner = ProcessSpawner::current_exe(&settings)?;
            Supervisor::from_settings(&settings, spawner)
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
    }

    Ok(())
}
