//! Raw access to a USB device's interrupt endpoint
//!
//! Locate a device by vendor/product id, claim the interface owning an
//! endpoint, and stream every completed interrupt transfer into a handler.
//! Each completion is resubmitted immediately, so the stream runs until it
//! is closed or event processing fails.
//!
//! ```no_run
//! use std::sync::Arc;
//! use facade::{CallbackBinding, InterruptDevice, InterruptRequest, RusbBackend};
//!
//! let backend = RusbBackend::new()?;
//! let binding = Arc::new(CallbackBinding::new(|data| println!("{:02x?}", data)));
//! let request = InterruptRequest::new(0x1234, 0x5678, 0x81, 8);
//!
//! let mut device = InterruptDevice::try_open(&backend, request, binding)?;
//! loop {
//!     device.pump()?;
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod api;
pub mod backend;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod transfer;
pub mod version;

pub use backend::{RusbBackend, SimBackend, UsbBackend};
pub use descriptor::{
    DEFAULT_STRING_LENGTH, format_version_code, read_string_descriptor,
};
pub use device::{DEFAULT_MAX_LENGTH, InterruptDevice, InterruptRequest, listen};
pub use error::DeviceError;
pub use transfer::{CallbackBinding, Handler, TransferShared};
pub use version::{CURRENT_VERSION, check_api_version};
