//! Boundary operations for host integrations
//!
//! A thin layer over [`InterruptDevice`] shaped for callers that think in
//! nullable handles and process exit codes, such as scripting-host bindings
//! and the command-line front end.

use std::sync::Arc;
use tracing::debug;

use crate::backend::UsbBackend;
use crate::device::{InterruptDevice, InterruptRequest, listen};
use crate::transfer::{CallbackBinding, Handler};

/// Process-style success code
pub const EXIT_SUCCESS: i32 = 0;

/// Process-style failure code
pub const EXIT_FAILURE: i32 = 1;

fn request(vendor_id: u16, product_id: u16, endpoint: u8, max_length: u32) -> InterruptRequest {
    InterruptRequest::new(vendor_id, product_id, endpoint, max_length as usize)
}

/// Open an interrupt stream without blocking
///
/// Returns `None` when the open sequence fails; everything acquired has
/// been released by then. A returned device has a live transfer, and the
/// caller must keep pumping it (see [`InterruptDevice::pump`]) for the
/// handler to ever run.
pub fn open_interrupt<B: UsbBackend>(
    backend: &B,
    vendor_id: u16,
    product_id: u16,
    endpoint: u8,
    max_length: u32,
    handler: Option<Handler>,
) -> Option<InterruptDevice<'_, B>> {
    let binding = Arc::new(CallbackBinding::from_handler(handler));
    InterruptDevice::try_open(
        backend,
        request(vendor_id, product_id, endpoint, max_length),
        binding,
    )
    .ok()
}

/// Release a device; tolerates `None` and repeated calls
pub fn close_interrupt<B: UsbBackend>(device: Option<&mut InterruptDevice<'_, B>>) {
    if let Some(device) = device {
        device.close();
    }
}

/// True iff the device is present and has a non-zero recorded error
///
/// This is the predicate host integrations already depend on. Note the
/// polarity: a freshly opened, healthy device reports `false`.
pub fn is_open<B: UsbBackend>(device: Option<&InterruptDevice<'_, B>>) -> bool {
    device.is_some_and(|device| device.error_code() != 0)
}

/// Run the blocking drive and report the outcome as an exit code
///
/// The session only ends when event processing fails, so a session that
/// got as far as streaming still reports [`EXIT_FAILURE`].
pub fn listen_blocking<B: UsbBackend>(
    backend: &B,
    vendor_id: u16,
    product_id: u16,
    endpoint: u8,
    max_length: u32,
    handler: Option<Handler>,
) -> i32 {
    let binding = Arc::new(CallbackBinding::from_handler(handler));
    let err = listen(
        backend,
        request(vendor_id, product_id, endpoint, max_length),
        binding,
    );
    debug!("Blocking listen ended: {} (code {})", err, err.code());

    EXIT_FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimBackend, SimDevice};

    fn backend() -> SimBackend {
        SimBackend::new().with_device(SimDevice::new(0x1234, 0x5678).with_interface(0, &[0x81]))
    }

    #[test]
    fn test_open_interrupt_failure_is_none() {
        let backend = backend();
        assert!(open_interrupt(&backend, 0x1234, 0x5678, 0x99, 5, None).is_none());
        assert!(open_interrupt(&backend, 0xdead, 0xbeef, 0x81, 5, None).is_none());
        assert!(backend.is_idle());
    }

    #[test]
    fn test_is_open_literal_polarity() {
        let backend = backend();
        let device = open_interrupt(&backend, 0x1234, 0x5678, 0x81, 5, None);

        assert!(device.is_some());
        assert!(!is_open(device.as_ref()));
        assert!(!is_open::<SimBackend>(None));
    }

    #[test]
    fn test_close_interrupt_tolerates_none() {
        close_interrupt::<SimBackend>(None);

        let backend = backend();
        let mut device = open_interrupt(&backend, 0x1234, 0x5678, 0x81, 5, None);
        close_interrupt(device.as_mut());
        close_interrupt(device.as_mut());
        assert!(backend.is_idle());
    }
}
