//! usb-facade command line
//!
//! Lists attached USB devices and streams raw interrupt endpoint data to
//! stdout.

mod config;
mod listen;
mod output;
mod report;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use common::setup_logging;
use facade::{CURRENT_VERSION, RusbBackend};
use tracing::{debug, info};

use config::CliConfig;
use listen::ListenArgs;

#[derive(Parser, Debug)]
#[command(name = "usb-facade")]
#[command(
    author,
    version,
    about = "Read data from USB devices raw, let your imagination run wild"
)]
#[command(long_about = "
Read raw interrupt transfers from a USB device and print them to stdout.

EXAMPLES:
    # List all devices with their interfaces and endpoints
    usb-facade list

    # Stream endpoint 0x81 of device 1234:5678, 8 bytes per transfer
    usb-facade listen --max-length 8 0x1234 0x5678 0x81

    # Stream a device preset from the configuration file
    usb-facade listen --device keypad

    # Enable libusb debug output
    usb-facade --debug list

CONFIGURATION:
    The configuration file is read from:
    1. Path specified with --config
    2. ~/.config/usb-facade/config.toml
    3. Built-in defaults
")]
struct Args {
    /// Enable libusb debug logging
    #[arg(short, long)]
    debug: bool,

    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List all USB devices and their information
    List,
    /// Read from a device's interrupt endpoint to stdout
    Listen(ListenArgs),
}

fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = CliConfig::default();
        let path = CliConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        CliConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        CliConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.general.log_level);

    setup_logging(log_level).context("Failed to setup logging")?;

    debug!(
        "usb-facade v{} (api {})",
        env!("CARGO_PKG_VERSION"),
        CURRENT_VERSION.code()
    );

    let Some(command) = args.command else {
        Args::command().print_help()?;
        return Ok(());
    };

    // Argument errors are reported before libusb is touched
    let target = match &command {
        Command::List => None,
        Command::Listen(listen_args) => Some(listen::resolve_target(listen_args, &config)?),
    };

    let mut backend = RusbBackend::new().context("Could not initialize libusb")?;
    if args.debug || config.general.libusb_debug {
        info!("Debugging mode enabled");
        backend.set_libusb_debug(true);
    }

    match target {
        None => report::run(&backend),
        Some(target) => listen::run(&backend, target),
    }
}
