//! download-daemon: Pulls the newest saved page off a paired handheld.
//!
//! Talks to the device through a directory mirror of its file store and keeps
//! every downloaded page in a local storage directory.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use download_core::EventBus;
use download_daemon::{ConfigOverrides, Daemon, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "download-daemon")]
#[command(about = "Downloads the newest saved page from a paired device")]
struct Args {
    /// Directory holding config.json (created with defaults if missing)
    #[arg(short, long, default_value = "config")]
    config: PathBuf,

    /// Directory mirroring the device
    #[arg(short, long)]
    device: Option<PathBuf>,

    /// Directory for downloaded pages
    #[arg(short, long)]
    storage: Option<PathBuf>,

    /// Bring the device link up at startup
    #[arg(long)]
    connect: bool,

    /// Do not watch the device's SAVED folder
    #[arg(long)]
    no_watch: bool,

    /// Abort runs that take longer than this many seconds (0 disables)
    #[arg(long)]
    run_timeout: Option<u64>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            storage_dir: self.storage.clone(),
            device_dir: self.device.clone(),
            connect_on_start: self.connect,
            no_watch: self.no_watch,
            run_timeout_secs: self.run_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,download_daemon=debug,download_core=debug"
    } else {
        "info,download_daemon=info,download_core=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting download-daemon");

    let config = DaemonConfig::load(&args.config)?.apply(args.overrides());
    info!("Device directory: {:?}", config.device_dir()?);
    info!("Storage directory: {:?}", config.storage_dir);

    let events = Arc::new(EventBus::new());
    let _saved = events.subscribe(|event| match serde_json::to_string(&event) {
        Ok(json) => info!("{} {}", event.id(), json),
        Err(e) => warn!("Failed to encode {}: {}", event.id(), e),
    });

    let mut daemon = Daemon::from_config(&config, events)
        .context("Failed to start daemon")?;

    if config.connect_on_start {
        info!("Bringing up device link");
        daemon.device().bring_up_link();
    }

    info!("Daemon running. Press Ctrl+C to stop.");

    daemon
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    info!("Shutting down");
    Ok(())
}
