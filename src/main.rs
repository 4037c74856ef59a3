//! Entry point: parse the CLI, load config, and start the broker or write
//! the restart marker for running ones to pick up.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use crest::config::BrokerConfig;
use crest::resolver::ControllerRegistry;
use crest::restart::{MarkerStore, RestartMarker};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "crest")]
#[command(about = "Pusher-protocol-compatible WebSocket broker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the broker.
    Start {
        /// Listen host for the WebSocket endpoint.
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Listen port for the WebSocket endpoint.
        #[arg(long, default_value_t = 6001)]
        port: u16,
        /// JSON config file with apps and TLS settings.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Skip statistics collection entirely.
        #[arg(long)]
        disable_statistics: bool,
        /// Seconds between statistics flushes.
        #[arg(long)]
        statistics_interval: Option<u64>,
        /// Verbose logging.
        #[arg(long)]
        debug: bool,
        /// Drain connections on shutdown signals instead of hard-stopping.
        #[arg(long)]
        soft: bool,
    },
    /// Signal running brokers to restart via the shared marker.
    Restart {
        /// Request a drain instead of a hard stop.
        #[arg(long)]
        soft: bool,
        /// JSON config file naming the shared marker database.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<BrokerConfig> {
    match path {
        Some(path) => Ok(BrokerConfig::load(path)?),
        None => Ok(BrokerConfig::from_env()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Start {
            host,
            port,
            config,
            disable_statistics,
            statistics_interval,
            debug,
            soft,
        } => {
            let default_directive = if debug { "crest=debug" } else { "crest=info" };
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(default_directive.parse()?),
                )
                .init();

            let mut config = load_config(config.as_ref())?;
            config.host = host;
            config.port = port;
            config.soft_shutdown = soft;
            if disable_statistics {
                config.statistics.enabled = false;
            }
            if let Some(interval) = statistics_interval {
                config.statistics.interval_seconds = interval;
            }

            info!(
                version = env!("CARGO_PKG_VERSION"),
                host = %config.host,
                port = config.port,
                apps = config.apps.len(),
                "starting crest"
            );
            crest::server::run(config, ControllerRegistry::new()).await?;
            Ok(())
        }
        Command::Restart { soft, config } => {
            let config = load_config(config.as_ref())?;
            let store = MarkerStore::open(&config.restart_marker_path)?;
            store.write(RestartMarker::now(soft))?;
            println!(
                "restart signalled ({} stop) via {}",
                if soft { "soft" } else { "hard" },
                config.restart_marker_path.display()
            );
            Ok(())
        }
    }
}
