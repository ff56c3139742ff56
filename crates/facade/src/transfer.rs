//! Transfer loop
//!
//! The completion side of an interrupt stream. A [`CallbackBinding`] carries
//! the caller's handler; a [`TransferShared`] is the state one transfer
//! object shares with its completion callback. Every completion delivers the
//! received bytes to the handler and then resubmits the same transfer, so a
//! single submission keeps the stream alive until something fails.
//!
//! Nothing here spawns threads. Completions run on whichever thread pumps the
//! backend's event processing.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, trace, warn};

/// Caller supplied handler, called once per completed transfer
///
/// The slice holds exactly the received bytes and borrows the device's
/// receive buffer, so it is only valid for the duration of the call.
pub type Handler = Box<dyn FnMut(&[u8]) + Send>;

/// The caller's handler plus the `paused` flag
pub struct CallbackBinding {
    handler: Mutex<Option<Handler>>,
    has_handler: bool,
    paused: AtomicBool,
}

impl CallbackBinding {
    /// Bind a handler
    pub fn new(handler: impl FnMut(&[u8]) + Send + 'static) -> Self {
        Self::from_handler(Some(Box::new(handler)))
    }

    /// Binding with no handler; completions are still resubmitted
    pub fn empty() -> Self {
        Self::from_handler(None)
    }

    pub fn from_handler(handler: Option<Handler>) -> Self {
        Self {
            has_handler: handler.is_some(),
            handler: Mutex::new(handler),
            paused: AtomicBool::new(false),
        }
    }

    pub fn has_handler(&self) -> bool {
        self.has_handler
    }

    /// Set the paused flag
    ///
    /// The flag is reserved for host integrations. Delivery and resubmission
    /// do not consult it.
    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Call the handler if one is bound; returns whether it ran
    ///
    /// The handler is taken out of the binding for the duration of the call,
    /// so it may use its own binding freely. A nested delivery from inside
    /// the handler finds the slot empty and does nothing.
    pub(crate) fn deliver(&self, data: &[u8]) -> bool {
        if !self.has_handler {
            return false;
        }

        let mut slot = HandlerSlot {
            binding: self,
            handler: self.lock_handler().take(),
        };
        match slot.handler.as_mut() {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    fn lock_handler(&self) -> MutexGuard<'_, Option<Handler>> {
        // The slot is never left half-updated, so poisoning can be ignored
        self.handler.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CallbackBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackBinding")
            .field("has_handler", &self.has_handler())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// Puts a taken handler back into its binding, also when the handler panics
struct HandlerSlot<'a> {
    binding: &'a CallbackBinding,
    handler: Option<Handler>,
}

impl Drop for HandlerSlot<'_> {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            *self.binding.lock_handler() = Some(handler);
        }
    }
}

/// State shared between one transfer object and its completion callback
#[derive(Debug)]
pub struct TransferShared {
    binding: Arc<CallbackBinding>,
    in_flight: AtomicBool,
    closing: AtomicBool,
    completions: AtomicU64,
    resubmissions: AtomicU64,
    fault: Mutex<Option<rusb::Error>>,
}

impl TransferShared {
    pub fn new(binding: Arc<CallbackBinding>) -> Arc<Self> {
        Arc::new(Self {
            binding,
            in_flight: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            completions: AtomicU64::new(0),
            resubmissions: AtomicU64::new(0),
            fault: Mutex::new(None),
        })
    }

    pub fn binding(&self) -> &Arc<CallbackBinding> {
        &self.binding
    }

    /// Whether the transfer is currently owned by the USB library
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Number of completions seen so far
    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Acquire)
    }

    /// Number of resubmission attempts made by the completion callback
    pub fn resubmissions(&self) -> u64 {
        self.resubmissions.load(Ordering::Acquire)
    }

    /// Error recorded by a failed resubmission or a panicking handler
    pub fn fault(&self) -> Option<rusb::Error> {
        *self.lock_fault()
    }

    /// Run a submit call and mark the transfer in flight if it succeeds
    pub fn submit_with(&self, submit: impl FnOnce() -> rusb::Result<()>) -> rusb::Result<()> {
        submit()?;
        self.in_flight.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop resubmitting; used while the owning transfer is being freed
    pub fn begin_teardown(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Record that the library handed back a cancelled transfer
    pub fn mark_cancelled(&self) {
        self.in_flight.store(false, Ordering::Release);
        trace!("Transfer cancellation observed");
    }

    /// Completion callback body
    ///
    /// Delivers `data` to the bound handler, if any, then makes exactly one
    /// resubmission attempt through `resubmit`. A failed resubmission is not
    /// returned here; it is recorded and reported by the next pump of the
    /// owning device. During teardown the transfer is left idle instead.
    pub fn complete(&self, data: &[u8], resubmit: impl FnOnce() -> rusb::Result<()>) {
        self.in_flight.store(false, Ordering::Release);

        if self.closing.load(Ordering::Acquire) {
            trace!("Completion during teardown, not resubmitting");
            return;
        }

        self.completions.fetch_add(1, Ordering::AcqRel);

        let delivered = catch_unwind(AssertUnwindSafe(|| self.binding.deliver(data)));
        if delivered.is_err() {
            error!("Transfer handler panicked");
            self.record_fault(rusb::Error::Other);
        }

        self.resubmissions.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = self.submit_with(resubmit) {
            warn!("Failed to resubmit transfer: {}", e);
            self.record_fault(e);
        }
    }

    fn record_fault(&self, err: rusb::Error) {
        self.lock_fault().get_or_insert(err);
    }

    fn lock_fault(&self) -> MutexGuard<'_, Option<rusb::Error>> {
        self.fault.lock().unwrap_or_else(|e| e.into_inner())
    }
}
