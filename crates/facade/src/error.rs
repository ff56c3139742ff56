//! Device error types
//!
//! Every stage of the open sequence fails with its own kind so that callers
//! can tell "nothing plugged in" apart from "plugged in but busy". The
//! underlying libusb code is kept on each kind and exposed through
//! [`DeviceError::code`].

use thiserror::Error;

/// libusb's catch-all error code
pub const LIBUSB_ERROR_OTHER: i32 = -99;

/// Errors raised while opening or driving an interrupt device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// No device matches the requested identification, or it could not be opened
    #[error("device {vendor_id:#06x}:{product_id:#06x} not found or not openable: {source}")]
    DeviceNotFound {
        vendor_id: u16,
        product_id: u16,
        #[source]
        source: rusb::Error,
    },

    /// Active configuration descriptor could not be retrieved
    #[error("could not get the active config descriptor: {0}")]
    DescriptorUnavailable(#[source] rusb::Error),

    /// No interface/alt-setting exposes the requested endpoint
    #[error("endpoint {address:#04x} not found in the active configuration")]
    EndpointNotFound { address: u8 },

    /// Claiming the interface was rejected
    #[error("could not claim interface {interface}: {source}")]
    InterfaceClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    /// The transfer object could not be allocated
    #[error("could not allocate transfer: {0}")]
    TransferAllocFailed(#[source] rusb::Error),

    /// The transfer could not be queued
    #[error("could not submit transfer: {0}")]
    SubmitFailed(#[source] rusb::Error),

    /// Event processing failed mid-session
    #[error("event processing failed: {0}")]
    EventProcessingFailed(#[source] rusb::Error),
}

impl DeviceError {
    /// libusb-style negative code for this error
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::EndpointNotFound { .. } => rusb_error_code(rusb::Error::NotFound),
            _ => self.usb_error().map(rusb_error_code).unwrap_or(LIBUSB_ERROR_OTHER),
        }
    }

    /// Underlying USB library error, if the kind carries one
    pub fn usb_error(&self) -> Option<rusb::Error> {
        match *self {
            DeviceError::DeviceNotFound { source, .. } => Some(source),
            DeviceError::DescriptorUnavailable(e) => Some(e),
            DeviceError::EndpointNotFound { .. } => None,
            DeviceError::InterfaceClaimFailed { source, .. } => Some(source),
            DeviceError::TransferAllocFailed(e) => Some(e),
            DeviceError::SubmitFailed(e) => Some(e),
            DeviceError::EventProcessingFailed(e) => Some(e),
        }
    }

    /// True when the descriptor lookup failed because the device has no active configuration
    pub fn is_unconfigured(&self) -> bool {
        matches!(self, DeviceError::DescriptorUnavailable(rusb::Error::NotFound))
    }
}

/// Map rusb::Error to the negative code libusb returned for it
pub fn rusb_error_code(err: rusb::Error) -> i32 {
    match err {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => LIBUSB_ERROR_OTHER,
    }
}

/// Map a raw libusb return code back to rusb::Error
///
/// Only meaningful for negative codes; callers check for success first.
pub fn rusb_error_from_code(code: i32) -> rusb::Error {
    match code {
        -1 => rusb::Error::Io,
        -2 => rusb::Error::InvalidParam,
        -3 => rusb::Error::Access,
        -4 => rusb::Error::NoDevice,
        -5 => rusb::Error::NotFound,
        -6 => rusb::Error::Busy,
        -7 => rusb::Error::Timeout,
        -8 => rusb::Error::Overflow,
        -9 => rusb::Error::Pipe,
        -10 => rusb::Error::Interrupted,
        -11 => rusb::Error::NoMem,
        -12 => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}
