//! USB access backends
//!
//! [`UsbBackend`] is the seam between the device lifecycle and the library
//! that actually talks to USB. It is an explicit value owned by the
//! application and passed into every device operation; nothing in this crate
//! keeps a process-wide USB context.
//!
//! Two implementations ship with the crate:
//! - [`RusbBackend`]: libusb through `rusb`, with asynchronous interrupt
//!   transfers driven by libusb's event handling
//! - [`SimBackend`]: a scripted in-memory device used by the tests

use std::sync::Arc;

use crate::descriptor::ConfigTree;
use crate::transfer::TransferShared;

pub mod libusb;
pub mod sim;

pub use libusb::{RusbBackend, RusbTransfer};
pub use sim::{SimBackend, SimDevice, SimEvent, SimOp, SimStage};

/// Operations the interrupt device needs from a USB access library
///
/// Errors are the library's own codes. Resources are released by dropping
/// the values returned here; the device drops them in reverse acquisition
/// order.
pub trait UsbBackend {
    /// Open device connection
    type Handle;
    /// Active configuration descriptor
    type Config: ConfigTree;
    /// One interrupt transfer together with its receive buffer
    ///
    /// Must be dropped before the handle it was allocated against.
    type Transfer;

    /// Open the first device matching vendor and product id
    fn open_device(&self, vendor_id: u16, product_id: u16) -> rusb::Result<Self::Handle>;

    /// Ask the library to detach kernel drivers when claiming interfaces
    fn set_auto_detach_kernel_driver(&self, handle: &mut Self::Handle) -> rusb::Result<()>;

    /// Fetch the active configuration descriptor
    fn active_config_descriptor(&self, handle: &Self::Handle) -> rusb::Result<Self::Config>;

    fn claim_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()>;

    fn release_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()>;

    /// Allocate an interrupt transfer with a `length` byte receive buffer
    ///
    /// Completions of the transfer are routed to [`TransferShared::complete`].
    fn alloc_interrupt_transfer(
        &self,
        handle: &Self::Handle,
        endpoint: u8,
        length: usize,
        shared: Arc<TransferShared>,
    ) -> rusb::Result<Self::Transfer>;

    /// Queue the transfer
    fn submit_transfer(&self, transfer: &mut Self::Transfer) -> rusb::Result<()>;

    /// Wait for and process one batch of completed events
    ///
    /// Completion callbacks run synchronously inside this call.
    fn handle_events(&self) -> rusb::Result<()>;
}
