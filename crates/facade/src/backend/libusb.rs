//! libusb backend
//!
//! Device, descriptor and interface operations go through rusb's safe API.
//! Interrupt transfers use libusb's asynchronous API from `rusb::ffi`, since
//! rusb only offers blocking transfers: the completion callback is what keeps
//! the stream alive between pumps of [`UsbContext::handle_events`].

use rusb::ffi::{self, constants::LIBUSB_TRANSFER_CANCELLED, libusb_transfer};
use rusb::{ConfigDescriptor, Context, DeviceHandle, LogLevel, UsbContext};
use std::os::raw::{c_int, c_void};
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::UsbBackend;
use crate::error::rusb_error_from_code;
use crate::transfer::TransferShared;

/// Poll interval while waiting for a cancelled transfer to come back
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Number of polls before a cancelled transfer is given up on
const CANCEL_ATTEMPTS: u32 = 40;

/// Backend built on a libusb context
///
/// The context is created by the application and handed to every device
/// operation through this value.
#[derive(Clone)]
pub struct RusbBackend {
    context: Context,
}

impl RusbBackend {
    /// Initialize a new libusb context
    pub fn new() -> rusb::Result<Self> {
        Ok(Self::with_context(Context::new()?))
    }

    /// Wrap an existing context
    pub fn with_context(context: Context) -> Self {
        Self { context }
    }

    /// Get the underlying context
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Raise libusb's own logging to debug, or back to warnings
    pub fn set_libusb_debug(&mut self, enabled: bool) {
        let level = if enabled {
            LogLevel::Debug
        } else {
            LogLevel::Warning
        };
        self.context.set_log_level(level);
        debug!("libusb debug logging {}", if enabled { "enabled" } else { "disabled" });
    }
}

impl UsbBackend for RusbBackend {
    type Handle = DeviceHandle<Context>;
    type Config = ConfigDescriptor;
    type Transfer = RusbTransfer;

    fn open_device(&self, vendor_id: u16, product_id: u16) -> rusb::Result<Self::Handle> {
        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    debug!(
                        "Skipping device on bus {} address {}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
                debug!(
                    "Found {:04x}:{:04x} on bus {} address {}",
                    vendor_id,
                    product_id,
                    device.bus_number(),
                    device.address()
                );
                return device.open();
            }
        }

        Err(rusb::Error::NotFound)
    }

    fn set_auto_detach_kernel_driver(&self, handle: &mut Self::Handle) -> rusb::Result<()> {
        handle.set_auto_detach_kernel_driver(true)
    }

    fn active_config_descriptor(&self, handle: &Self::Handle) -> rusb::Result<Self::Config> {
        handle.device().active_config_descriptor()
    }

    fn claim_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()> {
        handle.claim_interface(interface)
    }

    fn release_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()> {
        handle.release_interface(interface)
    }

    fn alloc_interrupt_transfer(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        length: usize,
        shared: Arc<TransferShared>,
    ) -> rusb::Result<Self::Transfer> {
        let length_c = c_int::try_from(length).map_err(|_| rusb::Error::InvalidParam)?;

        // SAFETY: plain allocation, checked for null below
        let raw = unsafe { ffi::libusb_alloc_transfer(0) };
        let raw = NonNull::new(raw).ok_or(rusb::Error::NoMem)?;

        let mut buffer = vec![0u8; length].into_boxed_slice();
        let user_data = Arc::as_ptr(&shared) as *mut c_void;

        // SAFETY: `raw` was just allocated. The buffer and the shared state
        // are owned by the returned RusbTransfer, which frees the transfer
        // before either of them and is itself dropped before the handle.
        unsafe {
            ffi::libusb_fill_interrupt_transfer(
                raw.as_ptr(),
                handle.as_raw(),
                endpoint,
                buffer.as_mut_ptr(),
                length_c,
                interrupt_transfer_cb,
                user_data,
                0,
            );
        }

        trace!("Allocated interrupt transfer for endpoint {:#04x}", endpoint);

        Ok(RusbTransfer {
            raw,
            buffer: Some(buffer),
            shared,
            context: self.context.clone(),
        })
    }

    fn submit_transfer(&self, transfer: &mut Self::Transfer) -> rusb::Result<()> {
        let raw = transfer.raw.as_ptr();
        transfer.shared.submit_with(|| submit_raw(raw))
    }

    fn handle_events(&self) -> rusb::Result<()> {
        self.context.handle_events(None)
    }
}

/// One libusb interrupt transfer and the buffer it receives into
pub struct RusbTransfer {
    raw: NonNull<libusb_transfer>,
    buffer: Option<Box<[u8]>>,
    shared: Arc<TransferShared>,
    context: Context,
}

// SAFETY: the raw transfer is only touched by its owner and by the
// completion callback, which libusb runs inside handle_events on the thread
// pumping the context; completions of one transfer are serialized.
unsafe impl Send for RusbTransfer {}

impl RusbTransfer {
    /// Cancel an outstanding submission and wait for libusb to hand it back
    fn cancel_and_wait(&self) {
        // SAFETY: the transfer is live and was submitted
        let rc = unsafe { ffi::libusb_cancel_transfer(self.raw.as_ptr()) };
        if rc != 0 {
            debug!("Cancel transfer returned {}", rc);
        }

        let mut attempts = 0;
        while self.shared.is_in_flight() && attempts < CANCEL_ATTEMPTS {
            if let Err(e) = self.context.handle_events(Some(CANCEL_POLL)) {
                debug!("Error handling events during cancellation: {}", e);
            }
            attempts += 1;
        }
    }
}

impl Drop for RusbTransfer {
    fn drop(&mut self) {
        self.shared.begin_teardown();

        if self.shared.is_in_flight() {
            self.cancel_and_wait();
        }

        if self.shared.is_in_flight() {
            // libusb still owns the transfer and may write into the buffer
            warn!("Transfer did not come back after cancellation, leaking it");
            std::mem::forget(self.buffer.take());
            std::mem::forget(Arc::clone(&self.shared));
            return;
        }

        drop(self.buffer.take());
        trace!("Freed receive buffer");

        // SAFETY: not in flight, so libusb holds no reference to it
        unsafe { ffi::libusb_free_transfer(self.raw.as_ptr()) };
        trace!("Freed transfer");
    }
}

fn submit_raw(raw: *mut libusb_transfer) -> rusb::Result<()> {
    // SAFETY: callers pass a filled, live, idle transfer
    match unsafe { ffi::libusb_submit_transfer(raw) } {
        0 => Ok(()),
        code => Err(rusb_error_from_code(code)),
    }
}

/// Bytes received by a completed transfer
///
/// # Safety
///
/// `transfer.buffer` must be null or valid for `transfer.actual_length`
/// bytes for the lifetime of the borrow.
unsafe fn received_data(transfer: &libusb_transfer) -> &[u8] {
    let length = usize::try_from(transfer.actual_length).unwrap_or(0);
    if transfer.buffer.is_null() || length == 0 {
        return &[];
    }
    // SAFETY: guaranteed by the caller
    unsafe { std::slice::from_raw_parts(transfer.buffer, length) }
}

extern "system" fn interrupt_transfer_cb(transfer: *mut libusb_transfer) {
    // SAFETY: libusb passes back the transfer filled in
    // alloc_interrupt_transfer. user_data points at the TransferShared kept
    // alive by the owning RusbTransfer, which does not free the transfer or
    // its buffer while it is in flight.
    let (shared, status, data) = unsafe {
        let transfer = &*transfer;
        let shared = &*(transfer.user_data as *const TransferShared);
        (shared, transfer.status, received_data(transfer))
    };

    if status == LIBUSB_TRANSFER_CANCELLED {
        shared.mark_cancelled();
        return;
    }

    trace!("Interrupt transfer completed: status {}, {} bytes", status, data.len());
    shared.complete(data, || submit_raw(transfer));
}
