//! vhc Device
//!
//! Device process for the virtual host controller. Serves the loopback
//! emulation on a Unix socket until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::{LoopbackDevice, setup_logging};
use tokio::signal;
use tracing::{error, info};
use vdev::{DeviceServer, VdevConfig};

#[derive(Parser, Debug)]
#[command(name = "vhc-vdev")]
#[command(author, version, about = "Virtual USB device process")]
#[command(long_about = "
Device process for the virtual USB host controller. Emulates a loopback
device (echo on endpoint 1) and serves it to vhc-host over a Unix socket.

EXAMPLES:
    # Serve on the configured socket
    vhc-vdev

    # Serve on a specific socket with debug logging
    vhc-vdev --socket /tmp/vdev.sock --log-level debug

CONFIGURATION:
    The device process looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vhc/vdev.toml
    3. /etc/vhc/vdev.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Socket to listen on (overrides the config file)
    #[arg(short, long, value_name = "PATH")]
    socket: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = VdevConfig::default();
        let path = VdevConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        VdevConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        VdevConfig::load_or_default()
    };

    if let Some(socket) = args.socket {
        config.vdev.socket = socket;
    }

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.vdev.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("vhc Device v{}", env!("CARGO_PKG_VERSION"));

    run(config).await
}

#[cfg(unix)]
async fn run(config: VdevConfig) -> Result<()> {
    let socket_path = config.socket_path();

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }
    // A socket left behind by an earlier run would make bind fail
    if socket_path.exists() {
        std::fs::remove_file(&socket_path).with_context(|| {
            format!("Failed to remove stale socket: {}", socket_path.display())
        })?;
    }

    let listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    info!("Serving loopback device on {}", socket_path.display());

    let (server, worker_handle) =
        DeviceServer::spawn(LoopbackDevice::new()).context("Failed to spawn device worker")?;

    let result = tokio::select! {
        result = server.serve_unix(listener) => result.context("Device server failed"),
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    if let Err(e) = server.shutdown().await {
        error!("Error shutting down device worker: {}", e);
    }
    if let Err(e) = worker_handle.join() {
        error!("Device worker thread panicked: {:?}", e);
    }
    if let Err(e) = std::fs::remove_file(&socket_path) {
        error!("Failed to remove socket {}: {}", socket_path.display(), e);
    }

    info!("Device process stopped");
    result
}

#[cfg(not(unix))]
async fn run(_config: VdevConfig) -> Result<()> {
    Err(anyhow::anyhow!("vhc-vdev needs Unix domain sockets"))
}
