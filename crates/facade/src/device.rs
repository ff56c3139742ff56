//! Interrupt device handle
//!
//! [`InterruptDevice`] owns everything an interrupt stream needs: the open
//! device connection, the active configuration descriptor, the claimed
//! interface and one transfer with its receive buffer. Resources are
//! acquired in that order by [`InterruptDevice::open`] and released in
//! reverse by [`InterruptDevice::close`], which is idempotent and also runs
//! on drop. A failure at any acquisition stage releases whatever was already
//! acquired before `open` returns.
//!
//! Two drive strategies share this type:
//! - externally pumped: the host calls [`InterruptDevice::pump`] on its own
//!   schedule; without pumping no completion is ever delivered
//! - owned loop: [`InterruptDevice::run`] and [`listen`] block the calling
//!   thread until event processing fails
//!
//! Closing a device while another thread is inside the backend's event
//! processing for the same context is not supported; serialize the two.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::UsbBackend;
use crate::descriptor::find_endpoint;
use crate::error::DeviceError;
use crate::transfer::{CallbackBinding, TransferShared};

/// Default receive buffer length
pub const DEFAULT_MAX_LENGTH: usize = 5;

/// Identification of the endpoint to listen on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptRequest {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Endpoint address, direction bit included (IN endpoints have bit 7 set)
    pub endpoint: u8,
    /// Receive buffer length; no completion delivers more than this
    pub max_length: usize,
}

impl InterruptRequest {
    pub fn new(vendor_id: u16, product_id: u16, endpoint: u8, max_length: usize) -> Self {
        Self {
            vendor_id,
            product_id,
            endpoint,
            max_length,
        }
    }
}

/// A device with a claimed interface and one live interrupt transfer
pub struct InterruptDevice<'a, B: UsbBackend> {
    backend: &'a B,
    request: InterruptRequest,
    handle: Option<B::Handle>,
    config: Option<B::Config>,
    interface: Option<u8>,
    transfer: Option<B::Transfer>,
    shared: Arc<TransferShared>,
    error: Option<DeviceError>,
}

impl<'a, B: UsbBackend> InterruptDevice<'a, B> {
    /// Run the open sequence
    ///
    /// Always returns a device. Success is [`error`](Self::error) being
    /// `None`; on failure every resource acquired so far has already been
    /// released and the device only carries the error.
    pub fn open(backend: &'a B, request: InterruptRequest, binding: Arc<CallbackBinding>) -> Self {
        let mut device = Self {
            backend,
            request,
            handle: None,
            config: None,
            interface: None,
            transfer: None,
            shared: TransferShared::new(binding),
            error: None,
        };

        match device.acquire() {
            Ok(()) => {
                info!(
                    "Listening on {:04x}:{:04x} endpoint {:#04x} (interface {})",
                    request.vendor_id,
                    request.product_id,
                    request.endpoint,
                    device.interface.unwrap_or_default()
                );
            }
            Err(err) => {
                warn!("Failed to open interrupt device: {}", err);
                device.record_error(err);
                device.close();
            }
        }

        device
    }

    /// Like [`open`](Self::open) but returns the failure as an error
    pub fn try_open(
        backend: &'a B,
        request: InterruptRequest,
        binding: Arc<CallbackBinding>,
    ) -> Result<Self, DeviceError> {
        let device = Self::open(backend, request, binding);
        if let Some(err) = device.error() {
            return Err(err);
        }
        Ok(device)
    }

    fn acquire(&mut self) -> Result<(), DeviceError> {
        let backend = self.backend;
        let request = self.request;

        let handle = backend
            .open_device(request.vendor_id, request.product_id)
            .map_err(|source| DeviceError::DeviceNotFound {
                vendor_id: request.vendor_id,
                product_id: request.product_id,
                source,
            })?;
        let handle = self.handle.insert(handle);
        debug!("Opened device {:04x}:{:04x}", request.vendor_id, request.product_id);

        if let Err(e) = backend.set_auto_detach_kernel_driver(handle) {
            debug!("Kernel driver auto-detach unavailable: {}", e);
        }

        let config = backend
            .active_config_descriptor(handle)
            .map_err(DeviceError::DescriptorUnavailable)?;
        let config = self.config.insert(config);
        debug!("Fetched active config descriptor");

        let slot = find_endpoint(&*config, request.endpoint).ok_or(DeviceError::EndpointNotFound {
            address: request.endpoint,
        })?;
        debug!(
            "Endpoint {:#04x} found on interface {} alt setting {}",
            slot.address, slot.interface_number, slot.alt_setting
        );

        backend
            .claim_interface(handle, slot.interface_number)
            .map_err(|source| DeviceError::InterfaceClaimFailed {
                interface: slot.interface_number,
                source,
            })?;
        self.interface = Some(slot.interface_number);
        debug!("Claimed interface {}", slot.interface_number);

        // A zero-length interrupt transfer would complete and resubmit forever
        if request.max_length == 0 {
            return Err(DeviceError::TransferAllocFailed(rusb::Error::InvalidParam));
        }

        let transfer = backend
            .alloc_interrupt_transfer(
                handle,
                request.endpoint,
                request.max_length,
                Arc::clone(&self.shared),
            )
            .map_err(DeviceError::TransferAllocFailed)?;
        let transfer = self.transfer.insert(transfer);
        debug!("Allocated transfer with {} byte buffer", request.max_length);

        backend
            .submit_transfer(transfer)
            .map_err(DeviceError::SubmitFailed)?;
        debug!("Submitted transfer");

        Ok(())
    }

    /// Release everything this device holds
    ///
    /// Order: transfer and its receive buffer, claimed interface,
    /// configuration descriptor, device handle. Fields that were never
    /// acquired are skipped and each one is cleared as it is released, so a
    /// second call does nothing. Release errors are logged, not returned.
    pub fn close(&mut self) {
        if let Some(transfer) = self.transfer.take() {
            drop(transfer);
            debug!("Freed transfer and receive buffer");
        }

        if let Some(interface) = self.interface.take() {
            if let Some(handle) = self.handle.as_mut() {
                match self.backend.release_interface(handle, interface) {
                    Ok(()) => debug!("Released interface {}", interface),
                    Err(e) => warn!("Failed to release interface {}: {}", interface, e),
                }
            }
        }

        if let Some(config) = self.config.take() {
            drop(config);
            debug!("Freed config descriptor");
        }

        if let Some(handle) = self.handle.take() {
            drop(handle);
            debug!(
                "Closed device {:04x}:{:04x}",
                self.request.vendor_id, self.request.product_id
            );
        }
    }

    /// Process one batch of events for the backend this device was opened on
    ///
    /// Completions for this device (and any other device sharing the
    /// backend) are delivered inside this call. A resubmission that failed
    /// inside a completion is reported here.
    pub fn pump(&mut self) -> Result<(), DeviceError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.transfer.is_none() {
            let err = DeviceError::EventProcessingFailed(rusb::Error::NoDevice);
            return Err(self.record_error(err));
        }
        self.check_fault()?;

        if let Err(e) = self.backend.handle_events() {
            return Err(self.record_error(DeviceError::EventProcessingFailed(e)));
        }

        self.check_fault()
    }

    /// Pump events until processing fails; returns the error that ended the loop
    pub fn run(&mut self) -> DeviceError {
        loop {
            if let Err(err) = self.pump() {
                return err;
            }
        }
    }

    fn check_fault(&mut self) -> Result<(), DeviceError> {
        match self.shared.fault() {
            Some(e) => Err(self.record_error(DeviceError::EventProcessingFailed(e))),
            None => Ok(()),
        }
    }

    /// Keep the first error; later ones do not overwrite it
    fn record_error(&mut self, err: DeviceError) -> DeviceError {
        *self.error.get_or_insert(err)
    }

    pub fn request(&self) -> &InterruptRequest {
        &self.request
    }

    /// First error recorded for this device, `None` while healthy
    pub fn error(&self) -> Option<DeviceError> {
        self.error
    }

    /// Recorded error as a libusb-style code, 0 when none
    pub fn error_code(&self) -> i32 {
        self.error.map(|e| e.code()).unwrap_or(0)
    }

    /// Claimed interface number, `None` when not claimed or released
    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn has_config(&self) -> bool {
        self.config.is_some()
    }

    pub fn has_transfer(&self) -> bool {
        self.transfer.is_some()
    }

    /// True when the transfer is allocated and no error has been recorded
    pub fn is_streaming(&self) -> bool {
        self.error.is_none() && self.transfer.is_some()
    }

    /// The binding completions are delivered through
    pub fn binding(&self) -> &Arc<CallbackBinding> {
        self.shared.binding()
    }

    /// Number of completions delivered so far
    pub fn completions(&self) -> u64 {
        self.shared.completions()
    }
}

impl<B: UsbBackend> Drop for InterruptDevice<'_, B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: UsbBackend> std::fmt::Debug for InterruptDevice<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptDevice")
            .field("request", &self.request)
            .field("has_handle", &self.has_handle())
            .field("has_config", &self.has_config())
            .field("interface", &self.interface)
            .field("has_transfer", &self.has_transfer())
            .field("error", &self.error)
            .finish()
    }
}

/// Blocking drive: open, pump until event processing fails, close
///
/// Blocks the calling thread for the whole session and has no timeout.
/// Returns the error that ended the session, which is the open failure if
/// the device never came up.
pub fn listen<B: UsbBackend>(
    backend: &B,
    request: InterruptRequest,
    binding: Arc<CallbackBinding>,
) -> DeviceError {
    let mut device = match InterruptDevice::try_open(backend, request, binding) {
        Ok(device) => device,
        Err(err) => return err,
    };

    let err = device.run();
    info!(
        "Listening stopped after {} transfers: {}",
        device.completions(),
        err
    );
    device.close();

    err
}
