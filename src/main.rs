//! stagehand: show-control runtime
//!
//! Compiles the opus, then serves component peers and operators over
//! websockets until interrupted.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use stagehand::opus::UnlocatedScript;
use stagehand::{launch, load_opus, Config, LoadOptions};

#[derive(Parser)]
#[command(name = "stagehand")]
#[command(about = "Show-control runtime for live performances")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "stagehand.toml")]
    config: PathBuf,

    /// Opus YAML file (overrides config file)
    #[arg(long, env = "STAGEHAND_OPUS")]
    opus: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(long, env = "STAGEHAND_LISTEN")]
    listen: Option<SocketAddr>,

    /// Do not preload assets or push them to components
    #[arg(long, env = "STAGEHAND_NO_SYNC_ASSETS")]
    no_sync_assets: bool,

    /// Start even if the opus fails validation
    #[arg(long, env = "STAGEHAND_LENIENT")]
    lenient: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("stagehand=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting stagehand");
    info!("Config file: {}", cli.config.display());

    let mut config = Config::load(&cli.config)?;
    if let Some(opus) = cli.opus {
        config.opus.path = opus;
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }
    if cli.no_sync_assets {
        config.opus.sync_assets = false;
    }
    if cli.lenient {
        config.opus.exit_on_validation_failure = false;
    }

    let options = LoadOptions {
        read_asset_data: config.opus.sync_assets,
        exit_on_validation_failure: config.opus.exit_on_validation_failure,
    };
    let opus = match load_opus(&config.opus.path, &options, &UnlocatedScript).await {
        Ok(opus) => Arc::new(opus),
        Err(e) => {
            error!(path = %config.opus.path.display(), "Failed to load opus: {e}");
            std::process::exit(1);
        }
    };

    let stagehand = launch(opus, &config).await?;
    info!(addr = %stagehand.local_addr(), "Stagehand ready");

    tokio::select! {
        result = stagehand.wait() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
