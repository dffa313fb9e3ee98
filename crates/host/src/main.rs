//! vhc Host
//!
//! Virtual USB host controller. Plugs the configured devices, enumerates each
//! one (SET_ADDRESS, then GET_DESCRIPTOR for the device descriptor), prints
//! what it found, and unplugs everything again.

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use common::{LoopbackDevice, setup_logging};
use host::config::{DeviceConfig, DeviceKind, HostConfig};
use host::vhc::requests::{control_read, set_address};
use host::{DeviceRegistry, DeviceTarget};
use protocol::{SetupPacket, UsbAddress};
use tracing::{error, info, warn};

/// Descriptor type of the standard device descriptor
const DESCRIPTOR_DEVICE: u8 = 1;
const DEVICE_DESCRIPTOR_SIZE: u16 = 18;

#[derive(Parser, Debug)]
#[command(name = "vhc-host")]
#[command(author, version, about = "Virtual USB host controller")]
#[command(long_about = "
Virtual USB host controller that schedules transfers to simulated devices.
Devices are emulated in-process or reached through a device process over
a Unix socket (see vhc-vdev).

EXAMPLES:
    # Enumerate the devices from the default config
    vhc-host

    # Run with a custom config and debug logging
    vhc-host --config ./host.toml --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/vhc/host.toml
    3. /etc/vhc/host.toml
    4. Built-in defaults (one loopback device)
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

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
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        HostConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("vhc Host v{}", env!("CARGO_PKG_VERSION"));

    if config.devices.is_empty() {
        info!("No devices configured, plugging a loopback device");
        config.devices.push(DeviceConfig {
            address: 0,
            kind: DeviceKind::Loopback,
            socket: None,
        });
    }

    let registry = DeviceRegistry::new(config.processor_settings());
    let mut failures = 0;

    // Devices are plugged one at a time so that each is alone at its
    // default address while it is being enumerated.
    for (index, device_config) in config.devices.iter().enumerate() {
        let assigned = UsbAddress::try_from(index + 1)
            .map_err(|_| anyhow!("Too many devices configured"))?;

        if let Err(e) = enumerate(&registry, device_config, assigned).await {
            error!("Device #{} failed to enumerate: {:#}", index, e);
            failures += 1;
        }
    }

    println!();
    println!("{} device(s) on the bus", registry.len());
    for device in registry.devices() {
        println!(
            "  {} at address {} ({}, queue {})",
            device.id(),
            device.address(),
            device.target().kind(),
            device.queue_len()
        );
    }

    registry.unplug_all().await;
    info!("All devices unplugged");

    if failures > 0 {
        warn!("{} device(s) failed to enumerate", failures);
    }
    Ok(())
}

/// Plug one device and walk it through address assignment
async fn enumerate(
    registry: &DeviceRegistry,
    device_config: &DeviceConfig,
    assigned: UsbAddress,
) -> Result<()> {
    let target = connect(device_config).await?;
    let device = registry
        .plug(device_config.address, target)
        .context("Failed to plug device")?;

    set_address(registry, device_config.address, assigned)
        .await
        .with_context(|| format!("SET_ADDRESS {} failed on {}", assigned, device.id()))?;

    let descriptor = control_read(
        registry,
        assigned,
        SetupPacket::get_descriptor(DESCRIPTOR_DEVICE, 0, DEVICE_DESCRIPTOR_SIZE),
    )
    .await
    .with_context(|| format!("GET_DESCRIPTOR failed on {}", device.id()))?;

    println!("{}", describe(device.id().to_string(), assigned, &descriptor));
    Ok(())
}

async fn connect(device_config: &DeviceConfig) -> Result<DeviceTarget> {
    match device_config.kind {
        DeviceKind::Loopback => Ok(DeviceTarget::local(LoopbackDevice::new())),
        DeviceKind::Remote => connect_remote(device_config).await,
    }
}

#[cfg(unix)]
async fn connect_remote(device_config: &DeviceConfig) -> Result<DeviceTarget> {
    let path = device_config
        .socket_path()
        .ok_or_else(|| anyhow!("Remote device has no socket path"))?;
    let executor = host::vhc::RemoteExecutor::connect(&path)
        .await
        .with_context(|| format!("Failed to connect to {}", path.display()))?;
    Ok(DeviceTarget::remote(executor))
}

#[cfg(not(unix))]
async fn connect_remote(_device_config: &DeviceConfig) -> Result<DeviceTarget> {
    Err(anyhow!("Remote devices need Unix domain sockets"))
}

fn describe(name: String, address: UsbAddress, descriptor: &[u8]) -> String {
    if descriptor.len() < DEVICE_DESCRIPTOR_SIZE as usize {
        return format!(
            "{} @ {}: short device descriptor ({} bytes)",
            name,
            address,
            descriptor.len()
        );
    }

    let usb_version = u16::from_le_bytes([descriptor[2], descriptor[3]]);
    let vendor_id = u16::from_le_bytes([descriptor[8], descriptor[9]]);
    let product_id = u16::from_le_bytes([descriptor[10], descriptor[11]]);

    format!(
        "{} @ {}: {:04x}:{:04x} USB {:x}.{:02x} class {:02x} max packet {}",
        name,
        address,
        vendor_id,
        product_id,
        usb_version >> 8,
        usb_version & 0xFF,
        descriptor[4],
        descriptor[7]
    )
}
