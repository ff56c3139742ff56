//! `list` subcommand: every attached device with its interfaces and endpoints

use anyhow::{Context as _, Result};
use facade::descriptor::{bcd_from_version, direction_label};
use facade::{DEFAULT_STRING_LENGTH, RusbBackend, format_version_code, read_string_descriptor};
use rusb::{Device, DeviceHandle, UsbContext};
use std::fmt::Write as _;
use tracing::{debug, warn};

/// What could be learned about one enumerated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEntry {
    /// The device descriptor itself was unreadable
    Skipped(rusb::Error),
    Described(DeviceReport),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReport {
    /// Raw BCD `bcdUSB`
    pub usb_version: u32,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class_code: u8,
    pub sub_class_code: u8,
    pub protocol_code: u8,
    pub access: DeviceAccess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceAccess {
    /// The platform cannot open this kind of device; descriptor data is all there is
    NotSupported,
    OpenFailed(rusb::Error),
    Opened {
        product: String,
        manufacturer: String,
        serial: String,
        config: ConfigState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigState {
    Unconfigured,
    Unavailable(rusb::Error),
    Active {
        name: Option<String>,
        interfaces: Vec<InterfaceReport>,
    },
}

/// First alternate setting of an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceReport {
    pub class_code: u8,
    pub endpoints: Vec<u8>,
}

/// Print the device listing to stdout
pub fn run(backend: &RusbBackend) -> Result<()> {
    let entries = collect(backend.context()).context("Could not get USB device list")?;
    print!("{}", render(&entries));
    Ok(())
}

/// Enumerate all devices on `context`
pub fn collect<T: UsbContext>(context: &T) -> rusb::Result<Vec<DeviceEntry>> {
    let devices = context.devices()?;
    debug!("Enumerated {} devices", devices.len());

    Ok(devices.iter().map(|device| describe(&device)).collect())
}

fn describe<T: UsbContext>(device: &Device<T>) -> DeviceEntry {
    let desc = match device.device_descriptor() {
        Ok(desc) => desc,
        Err(e) => return DeviceEntry::Skipped(e),
    };

    let access = match device.open() {
        Ok(handle) => {
            let config = match device.active_config_descriptor() {
                Ok(config) => ConfigState::Active {
                    name: config
                        .description_string_index()
                        .and_then(|index| read_string(&handle, index)),
                    interfaces: config
                        .interfaces()
                        .filter_map(|interface| interface.descriptors().next())
                        .map(|setting| InterfaceReport {
                            class_code: setting.class_code(),
                            endpoints: setting
                                .endpoint_descriptors()
                                .map(|e| e.address())
                                .collect(),
                        })
                        .collect(),
                },
                Err(rusb::Error::NotFound) => ConfigState::Unconfigured,
                Err(e) => ConfigState::Unavailable(e),
            };

            DeviceAccess::Opened {
                product: desc
                    .product_string_index()
                    .and_then(|index| read_string(&handle, index))
                    .unwrap_or_default(),
                manufacturer: desc
                    .manufacturer_string_index()
                    .and_then(|index| read_string(&handle, index))
                    .unwrap_or_default(),
                serial: desc
                    .serial_number_string_index()
                    .and_then(|index| read_string(&handle, index))
                    .unwrap_or_default(),
                config,
            }
        }
        Err(rusb::Error::NotSupported) => DeviceAccess::NotSupported,
        Err(e) => {
            warn!(
                "Could not open {:04x}:{:04x}, skipped: {}",
                desc.vendor_id(),
                desc.product_id(),
                e
            );
            DeviceAccess::OpenFailed(e)
        }
    };

    DeviceEntry::Described(DeviceReport {
        usb_version: bcd_from_version(desc.usb_version()),
        vendor_id: desc.vendor_id(),
        product_id: desc.product_id(),
        class_code: desc.class_code(),
        sub_class_code: desc.sub_class_code(),
        protocol_code: desc.protocol_code(),
        access,
    })
}

// Strings are best effort
fn read_string<T: UsbContext>(handle: &DeviceHandle<T>, index: u8) -> Option<String> {
    read_string_descriptor(handle, index, DEFAULT_STRING_LENGTH).ok()
}

/// Render the listing exactly as printed by `list`
pub fn render(entries: &[DeviceEntry]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "found {} USB devices:", entries.len());

    for (i, entry) in entries.iter().enumerate() {
        match entry {
            DeviceEntry::Skipped(e) => {
                let _ = write!(
                    out,
                    "could not get device descriptor from device, skipped\n  {}\n\n",
                    e
                );
            }
            DeviceEntry::Described(report) => render_device(&mut out, i, report),
        }
    }

    out
}

fn render_device(out: &mut String, index: usize, report: &DeviceReport) {
    let _ = writeln!(
        out,
        "Device {}: USB {} (VID {:#x} PID {:#x})",
        index,
        format_version_code(report.usb_version),
        report.vendor_id,
        report.product_id
    );
    let _ = writeln!(
        out,
        "Class {:#x} Subclass {:#x} Protocol {:#x}",
        report.class_code, report.sub_class_code, report.protocol_code
    );

    let (product, manufacturer, serial, config) = match &report.access {
        DeviceAccess::NotSupported => {
            out.push('\n');
            return;
        }
        DeviceAccess::OpenFailed(_) => return,
        DeviceAccess::Opened {
            product,
            manufacturer,
            serial,
            config,
        } => (product, manufacturer, serial, config),
    };

    let _ = writeln!(out, "Name '{}' made by '{}'", product, manufacturer);
    if !serial.is_empty() {
        let _ = writeln!(out, "SN '{}'", serial);
    }

    let (name, interfaces) = match config {
        ConfigState::Unconfigured => {
            out.push_str("device is in unconfigured state\n\n");
            return;
        }
        ConfigState::Unavailable(e) => {
            let _ = write!(out, "could not get the config descriptor, skipped\n  {}\n\n", e);
            return;
        }
        ConfigState::Active { name, interfaces } => (name, interfaces),
    };

    if let Some(name) = name {
        let _ = writeln!(out, "Configuration: {}", name);
    }
    let _ = writeln!(out, "Found {} interfaces", interfaces.len());

    for (j, interface) in interfaces.iter().enumerate() {
        let _ = writeln!(
            out,
            "Interface {}: Class {:#x} Endpoints ({}):",
            j,
            interface.class_code,
            interface.endpoints.len()
        );
        for (k, address) in interface.endpoints.iter().enumerate() {
            let _ = writeln!(
                out,
                "  {}: Address {:#x} {}",
                k,
                address,
                direction_label(*address)
            );
        }
        out.push('\n');
    }
}
