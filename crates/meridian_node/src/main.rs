// Meridian node binary entry point.
//
// Loads the deployment configuration, derives the local machine's
// coordinates from its address, starts the partition modules, and runs
// until interrupted. Clients and peer machines reach the modules through
// the network transport, which attaches to the broker channels.

use std::io::IsTerminal;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use meridian_node::config::Config;
use meridian_node::start_node;

#[derive(Parser, Debug)]
#[command(name = "meridian-node")]
struct Args {
    /// Path to the deployment configuration (JSON).
    #[arg(long)]
    config: PathBuf,

    /// Address of this machine, as listed in the configuration.
    #[arg(long)]
    address: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config, &args.address)
        .context("failed to load configuration")?;
    info!(
        "starting machine {} (replica {}, {} partitions, {} replicas)",
        config.local_machine_id(),
        config.local_replica(),
        config.num_partitions(),
        config.num_replicas(),
    );

    let node = start_node(config);
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutting down");
    node.shutdown().await;
    Ok(())
}
