//! Descriptor utilities
//!
//! Small helpers around USB descriptors: BCD version formatting, bounded
//! string descriptor reads, and flattening a configuration descriptor into
//! the endpoint slots the open sequence scans.

use rusb::{DeviceHandle, UsbContext};
use std::os::raw::c_int;
use tracing::debug;

use crate::error::rusb_error_from_code;

/// Default buffer size for string descriptor reads
pub const DEFAULT_STRING_LENGTH: usize = 100;

/// Convert a BCD version code into "major.minor" form
///
/// `0x0210` becomes `"2.1"`. The hexadecimal digit string of the code is
/// used as-is: the trailing digit is dropped and a dot is inserted after the
/// first digit. Codes with two or fewer hex digits yield an empty string.
pub fn format_version_code(code: u32) -> String {
    let mut digits = format!("{:x}", code);

    if digits.len() <= 2 {
        return String::new();
    }

    digits.pop();
    digits.insert(1, '.');
    digits
}

/// Rebuild the raw BCD code for a version parsed by rusb
pub fn bcd_from_version(version: rusb::Version) -> u32 {
    let major = u32::from(version.major());
    let major_bcd = ((major / 10) << 4) | (major % 10);

    let minor = u32::from(version.minor() & 0x0f);
    let sub_minor = u32::from(version.sub_minor() & 0x0f);

    (major_bcd << 8) | (minor << 4) | sub_minor
}

/// Interpret a string descriptor buffer filled by the USB library
///
/// The last byte of the buffer is forced to NUL before reading so that a
/// descriptor filling the whole buffer cannot leave trailing garbage. Text
/// ends at `length` or at the first NUL, whichever comes first.
pub fn decode_string_buffer(buffer: &mut [u8], length: usize) -> String {
    let Some(last) = buffer.last_mut() else {
        return String::new();
    };
    *last = 0;

    let text = &buffer[..length.min(buffer.len())];
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());

    String::from_utf8_lossy(&text[..end]).into_owned()
}

/// Read an ASCII string descriptor into a buffer of `max_length` bytes
///
/// The underlying library error is returned unchanged. Index 0 means the
/// device declares no string and is rejected without touching the device.
pub fn read_string_descriptor<T: UsbContext>(
    handle: &DeviceHandle<T>,
    index: u8,
    max_length: usize,
) -> rusb::Result<String> {
    if index == 0 || max_length == 0 {
        return Err(rusb::Error::InvalidParam);
    }

    let mut buffer = vec![0u8; max_length];
    let capacity = c_int::try_from(buffer.len()).unwrap_or(c_int::MAX);

    // SAFETY: the handle is open for the lifetime of the borrow and the
    // buffer is valid for `capacity` bytes.
    let length = unsafe {
        rusb::ffi::libusb_get_string_descriptor_ascii(
            handle.as_raw(),
            index,
            buffer.as_mut_ptr(),
            capacity,
        )
    };

    if length < 0 {
        debug!("String descriptor {} unavailable: code {}", index, length);
        return Err(rusb_error_from_code(length));
    }

    Ok(decode_string_buffer(&mut buffer, length as usize))
}

/// One endpoint position inside a configuration descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSlot {
    /// Interface number (bInterfaceNumber)
    pub interface_number: u8,
    /// Alternate setting number
    pub alt_setting: u8,
    /// Endpoint address, direction bit included
    pub address: u8,
}

impl EndpointSlot {
    /// True for device-to-host endpoints
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// A configuration descriptor that can be flattened into endpoint slots
pub trait ConfigTree {
    /// All slots in interface, alternate setting, endpoint order
    fn endpoint_slots(&self) -> Vec<EndpointSlot>;
}

impl ConfigTree for rusb::ConfigDescriptor {
    fn endpoint_slots(&self) -> Vec<EndpointSlot> {
        let mut slots = Vec::new();

        for interface in self.interfaces() {
            for setting in interface.descriptors() {
                for endpoint in setting.endpoint_descriptors() {
                    slots.push(EndpointSlot {
                        interface_number: interface.number(),
                        alt_setting: setting.setting_number(),
                        address: endpoint.address(),
                    });
                }
            }
        }

        slots
    }
}

/// Find the first slot exposing `address`
///
/// The scan stops at the first match, so the lowest interface wins, then
/// the lowest endpoint within it.
pub fn find_endpoint<C: ConfigTree + ?Sized>(config: &C, address: u8) -> Option<EndpointSlot> {
    config
        .endpoint_slots()
        .into_iter()
        .find(|slot| slot.address == address)
}

/// Human readable direction of an endpoint address
pub fn direction_label(address: u8) -> &'static str {
    if address & 0x80 != 0 {
        "IN (DEVICE-TO-HOST)"
    } else {
        "OUT (HOST-TO-DEVICE)"
    }
}
