//! Circuit relay daemon

use clap::{Parser, Subcommand};
use relay_core::{FanoutMetrics, LogMetrics, MetricsSink, RelayMetrics};
use relay_node::{Config, Identity, RelayNode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// relayd - lets peers behind NAT be reached through this node
#[derive(Parser)]
#[command(name = "relayd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay
    Run {
        /// Listen on loopback only
        #[arg(long)]
        local: bool,
    },

    /// Print the node's peer id
    Id,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.unwrap_or_else(Config::default_path);
    let mut config = Config::load_or_default(&config_path)?;

    // RUST_LOG wins over the configured level
    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.logging.level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run { local } => {
            config.network.local |= local;
            run(config).await
        }
        Commands::Id => {
            let identity = Identity::load_or_generate(&config.node.key_file)?;
            println!("{}", identity.peer_id());
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return Err(e.into());
    }

    let identity = Identity::load_or_generate(&config.node.key_file).inspect_err(|e| {
        tracing::error!(error = %e, path = %config.node.key_file.display(), "cannot load identity");
    })?;

    let counters = Arc::new(RelayMetrics::default());
    let metrics: Arc<dyn MetricsSink> = Arc::new(
        FanoutMetrics::new()
            .with(Arc::new(LogMetrics))
            .with(counters.clone()),
    );
    let node = RelayNode::bind(&config, &identity, metrics)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "cannot start relay"))?;

    tracing::info!(
        peer = %identity.peer_id(),
        agent = %config.node.agent,
        local = config.network.local,
        "relayd {}",
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = node.shutdown_token();
    let server = tokio::spawn(node.run());

    wait_for_signal().await?;
    tracing::info!("signal received");
    shutdown.cancel();
    server.await?;

    let totals = counters.snapshot();
    tracing::info!(
        reservations = totals.reservations_allowed,
        circuits = totals.connections_opened,
        bytes = totals.bytes_transferred,
        "relay totals"
    );
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
