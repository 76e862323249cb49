//! usb-relay physical side
//!
//! Attaches to a USB device on this host and relays its transfers to the
//! gadget side over UDP.

use anyhow::{Context, Result};
use clap::Parser;
use common::config::expand_path;
use common::{Channel, UdpTransport, setup_logging, spawn_delivery};
use physical::usb::{RusbPort, find_device, isochronous_endpoints, list_devices, open_device};
use physical::{PhysicalAdapter, PhysicalConfig};
use std::net::SocketAddr;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-relay-physical")]
#[command(
    author,
    version,
    about = "usb-relay physical side - relay a local USB device to a gadget host"
)]
#[command(long_about = "
Attaches to a USB device on this host, announces its descriptors to the gadget
side and relays every transfer between the device and the network.

EXAMPLES:
    # Relay the first non-hub device using the default config
    usb-relay-physical

    # Relay a specific device
    usb-relay-physical --device 0x1234:0x5678

    # Send to a different gadget host
    usb-relay-physical --peer 10.0.0.2:64240

    # List USB devices and exit
    usb-relay-physical --list-devices

LIMITATIONS:
    Isochronous endpoints (audio, video) are announced but not relayed; libusb
    offers no synchronous isochronous transfers. Bulk, interrupt and control
    traffic is relayed in full.

CONFIGURATION:
    The physical side looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-relay/physical.toml
    3. /etc/usb-relay/physical.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Device to relay as VID:PID (e.g. 0x1234:0x5678 or 0x1234:*)
    #[arg(short, long, value_name = "FILTER")]
    device: Option<String>,

    /// Local address to bind
    #[arg(long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Gadget side address
    #[arg(long, value_name = "ADDR")]
    peer: Option<SocketAddr>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// List USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = PhysicalConfig::default();
        let path = PhysicalConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        PhysicalConfig::load(Some(expand_path(path))).context("Failed to load configuration")?
    } else {
        PhysicalConfig::load_or_default()
    };

    if let Some(device) = args.device {
        config.usb.device = Some(device);
    }
    if let Some(bind) = args.bind {
        config.transport.bind = bind;
    }
    if let Some(peer) = args.peer {
        config.transport.peer = Some(peer);
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    setup_logging(&config.log_level).context("Failed to setup logging")?;
    info!("usb-relay physical side v{}", env!("CARGO_PKG_VERSION"));

    let context = rusb::Context::new().context("Failed to initialize libusb")?;

    if args.list_devices {
        for device in list_devices(&context)? {
            println!("{}", device);
        }
        return Ok(());
    }

    let device = find_device(&context, config.usb.device.as_deref())?;
    let opened = open_device(&device).context("Failed to open device")?;
    let port = RusbPort::new(opened.handle, opened.claimed);

    let (transport, inbound, receive_task) = UdpTransport::open(&config.transport)
        .await
        .context("Failed to open UDP transport")?;
    if let Some(peer) = transport.peer() {
        info!("Relaying to {}", peer);
    }

    let adapter = PhysicalAdapter::new(port.clone(), Channel::new("physical", transport.clone()));

    let handler = adapter.clone();
    let delivery = spawn_delivery("physical", inbound, move |message| {
        if let Err(e) = handler.handle_message(message) {
            warn!("Failed to handle message: {}", e);
        }
    });

    let unrelayed = isochronous_endpoints(&opened.identity);
    if !unrelayed.is_empty() {
        let names: Vec<String> = unrelayed.iter().map(ToString::to_string).collect();
        warn!("Isochronous endpoints will not be relayed: {}", names.join(", "));
    }

    adapter
        .attach(opened.identity)
        .context("Failed to announce device")?;

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down");
        }
        _ = port.wait_disconnected() => {
            info!("Device disconnected");
        }
    }

    adapter.detach();
    receive_task.abort();
    delivery.abort();
    Ok(())
}
