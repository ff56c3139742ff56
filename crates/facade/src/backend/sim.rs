//! Simulated USB backend
//!
//! An in-memory stand-in for a USB access library. Devices are described up
//! front, failures can be injected at any acquisition stage, and
//! `handle_events` replays a script of completions and errors. Every
//! acquire and release is appended to an ordered ledger so tests can check
//! teardown order and leaks without hardware.
//!
//! # Example
//!
//! ```
//! use facade::backend::{SimBackend, SimDevice, SimEvent};
//!
//! let backend = SimBackend::new()
//!     .with_device(SimDevice::new(0x1234, 0x5678).with_interface(0, &[0x81]))
//!     .with_events([SimEvent::Complete(vec![1, 2, 3])]);
//! assert_eq!(backend.live_handles(), 0);
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::trace;

use super::UsbBackend;
use crate::descriptor::{ConfigTree, EndpointSlot};
use crate::transfer::TransferShared;

/// Stage at which a failure can be injected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimStage {
    Open,
    AutoDetach,
    Config,
    Claim,
    Alloc,
    Submit,
    Resubmit,
    Release,
}

/// One entry in the simulated library's ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimOp {
    Open { vendor_id: u16, product_id: u16 },
    AutoDetach,
    ConfigFetched,
    Claim(u8),
    TransferAlloc { endpoint: u8, length: usize },
    Submit,
    HandleEvents,
    Cancel,
    BufferFreed,
    TransferFreed,
    Release(u8),
    ConfigFreed,
    Close,
}

/// Scripted outcome of one `handle_events` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    /// The in-flight transfer completes with these bytes (truncated to its buffer)
    Complete(Vec<u8>),
    /// Event processing itself fails
    Fail(rusb::Error),
}

/// Simulated interface: its number and the endpoint addresses of each alternate setting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInterface {
    pub number: u8,
    pub alt_settings: Vec<Vec<u8>>,
}

/// Simulated device description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interfaces: Vec<SimInterface>,
    /// An unconfigured device has no active configuration descriptor
    pub configured: bool,
}

impl SimDevice {
    pub fn new(vendor_id: u16, product_id: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            interfaces: Vec::new(),
            configured: true,
        }
    }

    /// Add an interface with a single alternate setting
    pub fn with_interface(mut self, number: u8, endpoints: &[u8]) -> Self {
        self.interfaces.push(SimInterface {
            number,
            alt_settings: vec![endpoints.to_vec()],
        });
        self
    }

    /// Add an alternate setting to interface `number`, creating it if needed
    pub fn with_alt_setting(mut self, number: u8, endpoints: &[u8]) -> Self {
        match self.interfaces.iter_mut().find(|i| i.number == number) {
            Some(interface) => interface.alt_settings.push(endpoints.to_vec()),
            None => return self.with_interface(number, endpoints),
        }
        self
    }

    pub fn unconfigured(mut self) -> Self {
        self.configured = false;
        self
    }

    fn endpoint_slots(&self) -> Vec<EndpointSlot> {
        let mut slots = Vec::new();
        for interface in &self.interfaces {
            for (setting, endpoints) in interface.alt_settings.iter().enumerate() {
                for &address in endpoints {
                    slots.push(EndpointSlot {
                        interface_number: interface.number,
                        alt_setting: setting as u8,
                        address,
                    });
                }
            }
        }
        slots
    }
}

struct TransferSlot {
    id: u64,
    length: usize,
    shared: Arc<TransferShared>,
}

#[derive(Default)]
struct SimState {
    devices: Vec<SimDevice>,
    failures: HashMap<SimStage, rusb::Error>,
    script: VecDeque<SimEvent>,
    ledger: Vec<SimOp>,
    transfers: Vec<TransferSlot>,
    claimed: Vec<(usize, u8)>,
    live_handles: usize,
    live_configs: usize,
    next_transfer_id: u64,
}

impl SimState {
    fn check(&self, stage: SimStage) -> rusb::Result<()> {
        match self.failures.get(&stage) {
            Some(&err) => Err(err),
            None => Ok(()),
        }
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Scripted USB backend
#[derive(Clone, Default)]
pub struct SimBackend {
    state: Arc<Mutex<SimState>>,
}

impl SimBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, device: SimDevice) -> Self {
        lock(&self.state).devices.push(device);
        self
    }

    /// Make every call at `stage` fail with `err`
    pub fn with_failure(self, stage: SimStage, err: rusb::Error) -> Self {
        lock(&self.state).failures.insert(stage, err);
        self
    }

    pub fn with_events(self, events: impl IntoIterator<Item = SimEvent>) -> Self {
        lock(&self.state).script.extend(events);
        self
    }

    /// Queue one more scripted event
    pub fn push_event(&self, event: SimEvent) {
        lock(&self.state).script.push_back(event);
    }

    /// Every operation so far, in order
    pub fn ledger(&self) -> Vec<SimOp> {
        lock(&self.state).ledger.clone()
    }

    pub fn clear_ledger(&self) {
        lock(&self.state).ledger.clear();
    }

    /// Number of submissions, initial and resubmitted
    pub fn submissions(&self) -> usize {
        lock(&self.state)
            .ledger
            .iter()
            .filter(|op| **op == SimOp::Submit)
            .count()
    }

    /// Interfaces currently claimed, across all devices
    pub fn claimed_interfaces(&self) -> Vec<u8> {
        lock(&self.state)
            .claimed
            .iter()
            .map(|&(_, interface)| interface)
            .collect()
    }

    pub fn live_handles(&self) -> usize {
        lock(&self.state).live_handles
    }

    pub fn live_configs(&self) -> usize {
        lock(&self.state).live_configs
    }

    pub fn live_transfers(&self) -> usize {
        lock(&self.state).transfers.len()
    }

    /// True when nothing acquired through this backend is still held
    pub fn is_idle(&self) -> bool {
        let state = lock(&self.state);
        state.live_handles == 0
            && state.live_configs == 0
            && state.transfers.is_empty()
            && state.claimed.is_empty()
    }

    fn resubmit(state: &Mutex<SimState>) -> rusb::Result<()> {
        let mut state = lock(state);
        state.ledger.push(SimOp::Submit);
        state.check(SimStage::Resubmit)
    }
}

/// Open simulated device
pub struct SimHandle {
    index: usize,
    device: SimDevice,
    state: Arc<Mutex<SimState>>,
}

impl Drop for SimHandle {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_handles -= 1;
        state.ledger.push(SimOp::Close);
        trace!(
            "Closed simulated device {:04x}:{:04x}",
            self.device.vendor_id, self.device.product_id
        );
    }
}

/// Simulated configuration descriptor
pub struct SimConfig {
    slots: Vec<EndpointSlot>,
    state: Arc<Mutex<SimState>>,
}

impl ConfigTree for SimConfig {
    fn endpoint_slots(&self) -> Vec<EndpointSlot> {
        self.slots.clone()
    }
}

impl Drop for SimConfig {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.live_configs -= 1;
        state.ledger.push(SimOp::ConfigFreed);
    }
}

/// Simulated transfer and its receive buffer
pub struct SimTransfer {
    id: u64,
    shared: Arc<TransferShared>,
    state: Arc<Mutex<SimState>>,
}

impl Drop for SimTransfer {
    fn drop(&mut self) {
        self.shared.begin_teardown();

        let mut state = lock(&self.state);
        if self.shared.is_in_flight() {
            state.ledger.push(SimOp::Cancel);
            self.shared.mark_cancelled();
        }
        state.ledger.push(SimOp::BufferFreed);
        state.ledger.push(SimOp::TransferFreed);
        state.transfers.retain(|slot| slot.id != self.id);
    }
}

impl UsbBackend for SimBackend {
    type Handle = SimHandle;
    type Config = SimConfig;
    type Transfer = SimTransfer;

    fn open_device(&self, vendor_id: u16, product_id: u16) -> rusb::Result<Self::Handle> {
        let mut state = lock(&self.state);
        state.ledger.push(SimOp::Open {
            vendor_id,
            product_id,
        });
        state.check(SimStage::Open)?;

        let (index, device) = state
            .devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|(index, d)| (index, d.clone()))
            .ok_or(rusb::Error::NotFound)?;

        state.live_handles += 1;
        Ok(SimHandle {
            index,
            device,
            state: Arc::clone(&self.state),
        })
    }

    fn set_auto_detach_kernel_driver(&self, _handle: &mut Self::Handle) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.ledger.push(SimOp::AutoDetach);
        state.check(SimStage::AutoDetach)
    }

    fn active_config_descriptor(&self, handle: &Self::Handle) -> rusb::Result<Self::Config> {
        let mut state = lock(&self.state);
        state.check(SimStage::Config)?;
        if !handle.device.configured {
            return Err(rusb::Error::NotFound);
        }

        state.ledger.push(SimOp::ConfigFetched);
        state.live_configs += 1;
        Ok(SimConfig {
            slots: handle.device.endpoint_slots(),
            state: Arc::clone(&self.state),
        })
    }

    fn claim_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.check(SimStage::Claim)?;
        if !handle.device.interfaces.iter().any(|i| i.number == interface) {
            return Err(rusb::Error::NotFound);
        }
        if state.claimed.contains(&(handle.index, interface)) {
            return Err(rusb::Error::Busy);
        }

        state.ledger.push(SimOp::Claim(interface));
        state.claimed.push((handle.index, interface));
        Ok(())
    }

    fn release_interface(&self, handle: &mut Self::Handle, interface: u8) -> rusb::Result<()> {
        let mut state = lock(&self.state);
        state.ledger.push(SimOp::Release(interface));
        state.claimed.retain(|&claim| claim != (handle.index, interface));
        state.check(SimStage::Release)
    }

    fn alloc_interrupt_transfer(
        &self,
        _handle: &Self::Handle,
        endpoint: u8,
        length: usize,
        shared: Arc<TransferShared>,
    ) -> rusb::Result<Self::Transfer> {
        let mut state = lock(&self.state);
        state.check(SimStage::Alloc)?;

        let id = state.next_transfer_id;
        state.next_transfer_id += 1;
        state.ledger.push(SimOp::TransferAlloc { endpoint, length });
        state.transfers.push(TransferSlot {
            id,
            length,
            shared: Arc::clone(&shared),
        });

        Ok(SimTransfer {
            id,
            shared,
            state: Arc::clone(&self.state),
        })
    }

    fn submit_transfer(&self, transfer: &mut Self::Transfer) -> rusb::Result<()> {
        transfer.shared.submit_with(|| {
            let mut state = lock(&self.state);
            state.ledger.push(SimOp::Submit);
            state.check(SimStage::Submit)
        })
    }

    fn handle_events(&self) -> rusb::Result<()> {
        let (event, target) = {
            let mut state = lock(&self.state);
            state.ledger.push(SimOp::HandleEvents);

            // An exhausted script behaves like an interrupted event loop
            let event = state.script.pop_front().ok_or(rusb::Error::Interrupted)?;
            let target = state
                .transfers
                .iter()
                .find(|slot| slot.shared.is_in_flight())
                .map(|slot| (Arc::clone(&slot.shared), slot.length));
            (event, target)
        };

        match event {
            SimEvent::Fail(err) => Err(err),
            SimEvent::Complete(mut data) => {
                if let Some((shared, length)) = target {
                    data.truncate(length);
                    shared.complete(&data, || Self::resubmit(&self.state));
                }
                Ok(())
            }
        }
    }
}
