//! `listen` subcommand

use anyhow::{Result, anyhow, bail};
use clap::Args;
use facade::descriptor::direction_label;
use facade::{CallbackBinding, DeviceError, InterruptRequest, RusbBackend};
use std::io;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{CliConfig, parse_u8, parse_u16};
use crate::output::{OutputFormat, write_delivery};

#[derive(Args, Debug, Default)]
#[command(after_help = "To find vid, pid and addr of a device use the 'list' command")]
pub struct ListenArgs {
    /// Maximum length of data to receive per transfer (in bytes)
    #[arg(long, value_name = "BYTES")]
    pub max_length: Option<u32>,

    /// Output format for received data
    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Use a device preset from the configuration file
    #[arg(long, value_name = "NAME", conflicts_with_all = ["vid", "pid", "addr"])]
    pub device: Option<String>,

    /// Vendor ID of the device (decimal or 0x hex)
    #[arg(value_parser = parse_u16, required_unless_present = "device")]
    pub vid: Option<u16>,

    /// Product ID of the device (decimal or 0x hex)
    #[arg(value_parser = parse_u16, required_unless_present = "device")]
    pub pid: Option<u16>,

    /// Endpoint address, direction must be IN (device to host)
    #[arg(value_parser = parse_u8, required_unless_present = "device")]
    pub addr: Option<u8>,
}

/// Fully resolved listen session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenTarget {
    pub request: InterruptRequest,
    pub format: OutputFormat,
}

/// Combine command line arguments with the configuration
///
/// Explicit flags win over a device preset, which wins over `[listen]`.
pub fn resolve_target(args: &ListenArgs, config: &CliConfig) -> Result<ListenTarget> {
    let format = args.format.unwrap_or(config.listen.format);

    let (vendor_id, product_id, endpoint, preset_length) = match &args.device {
        Some(name) => {
            let preset = config
                .device(name)
                .ok_or_else(|| anyhow!("No device preset named '{}' in configuration", name))?;
            let (vid, pid, addr) = preset.ids()?;
            (vid, pid, addr, preset.max_length)
        }
        None => match (args.vid, args.pid, args.addr) {
            (Some(vid), Some(pid), Some(addr)) => (vid, pid, addr, None),
            _ => bail!("vid, pid and addr are required without --device"),
        },
    };

    let max_length = args
        .max_length
        .or(preset_length)
        .unwrap_or(config.listen.max_length);
    if max_length == 0 {
        bail!("--max-length must be at least 1");
    }

    Ok(ListenTarget {
        request: InterruptRequest::new(vendor_id, product_id, endpoint, max_length as usize),
        format,
    })
}

/// Stream the endpoint to stdout until the session ends
///
/// Only returns once event processing fails or the device could not be
/// opened; either way the session counts as failed.
pub fn run(backend: &RusbBackend, target: ListenTarget) -> Result<()> {
    let request = target.request;
    if request.endpoint & 0x80 == 0 {
        warn!(
            "Endpoint {:#x} is {}, interrupt reads need an IN endpoint",
            request.endpoint,
            direction_label(request.endpoint)
        );
    }

    info!(
        "Listening on {:04x}:{:04x} endpoint {:#x} ({} bytes per transfer)",
        request.vendor_id, request.product_id, request.endpoint, request.max_length
    );

    let format = target.format;
    let binding = Arc::new(CallbackBinding::new(move |data: &[u8]| {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        if let Err(e) = write_delivery(&mut out, format, data) {
            warn!("Failed to write delivery: {}", e);
        }
    }));

    let err: DeviceError = facade::listen(backend, request, binding);
    Err(anyhow!(err).context(format!(
        "Listening on {:04x}:{:04x} failed (code {})",
        request.vendor_id,
        request.product_id,
        err.code()
    )))
}
