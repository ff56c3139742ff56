//! Integration tests for the interrupt device lifecycle
//!
//! Runs the open sequence, teardown and both drive strategies against the
//! simulated backend:
//! - Endpoint matching and interface claiming
//! - Unwinding after a failure at every acquisition stage
//! - Close idempotence
//! - Delivery and resubmission through the transfer loop
//!
//! Run with: `cargo test -p facade --test interrupt_device_tests`

use facade::api::{EXIT_FAILURE, close_interrupt, is_open, listen_blocking, open_interrupt};
use facade::backend::{SimBackend, SimDevice, SimEvent, SimOp, SimStage};
use facade::{CallbackBinding, DeviceError, InterruptDevice, InterruptRequest, listen};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak, mpsc};
use std::time::Duration;

const VID: u16 = 0x1234;
const PID: u16 = 0x5678;

fn keypad() -> SimDevice {
    SimDevice::new(VID, PID).with_interface(0, &[0x81])
}

fn request(endpoint: u8) -> InterruptRequest {
    InterruptRequest::new(VID, PID, endpoint, 5)
}

fn empty_binding() -> Arc<CallbackBinding> {
    Arc::new(CallbackBinding::empty())
}

fn recording_binding() -> (Arc<CallbackBinding>, Arc<Mutex<Vec<Vec<u8>>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let binding = CallbackBinding::new(move |data| sink.lock().unwrap().push(data.to_vec()));
    (Arc::new(binding), seen)
}

// ============================================================================
// Open sequence
// ============================================================================

mod open_sequence {
    use super::*;

    #[test]
    fn test_open_claims_matching_interface() {
        let backend = SimBackend::new().with_device(keypad());
        let device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        assert_eq!(device.error(), None);
        assert_eq!(device.error_code(), 0);
        assert_eq!(device.interface(), Some(0));
        assert_eq!(backend.claimed_interfaces(), vec![0]);
    }

    #[test]
    fn test_open_acquires_in_order() {
        let backend = SimBackend::new().with_device(keypad());
        let _device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        assert_eq!(
            backend.ledger(),
            vec![
                SimOp::Open {
                    vendor_id: VID,
                    product_id: PID
                },
                SimOp::AutoDetach,
                SimOp::ConfigFetched,
                SimOp::Claim(0),
                SimOp::TransferAlloc {
                    endpoint: 0x81,
                    length: 5
                },
                SimOp::Submit,
            ]
        );
    }

    #[test]
    fn test_open_claims_only_the_owning_interface() {
        let device = SimDevice::new(VID, PID)
            .with_interface(0, &[0x01, 0x82])
            .with_interface(1, &[0x83])
            .with_interface(2, &[0x84, 0x05]);
        let backend = SimBackend::new().with_device(device);

        let device = InterruptDevice::open(&backend, request(0x83), empty_binding());
        assert_eq!(device.interface(), Some(1));
        assert_eq!(backend.claimed_interfaces(), vec![1]);
    }

    #[test]
    fn test_open_first_match_wins() {
        let device = SimDevice::new(VID, PID)
            .with_interface(0, &[0x02])
            .with_interface(3, &[0x81])
            .with_interface(4, &[0x81]);
        let backend = SimBackend::new().with_device(device);

        let device = InterruptDevice::open(&backend, request(0x81), empty_binding());
        assert_eq!(device.interface(), Some(3));
    }

    #[test]
    fn test_open_scans_alternate_settings() {
        let device = SimDevice::new(VID, PID)
            .with_interface(0, &[0x01])
            .with_alt_setting(0, &[0x81]);
        let backend = SimBackend::new().with_device(device);

        let device = InterruptDevice::open(&backend, request(0x81), empty_binding());
        assert_eq!(device.interface(), Some(0));
    }

    #[test]
    fn test_open_endpoint_not_found() {
        let backend = SimBackend::new().with_device(keypad());
        let device = InterruptDevice::open(&backend, request(0x99), empty_binding());

        assert_eq!(device.error(), Some(DeviceError::EndpointNotFound { address: 0x99 }));
        assert!(!device.has_handle());
        assert!(!device.has_config());
        assert_eq!(device.interface(), None);
        assert!(!backend.ledger().iter().any(|op| matches!(op, SimOp::Claim(_))));
        assert!(backend.is_idle());
    }

    #[test]
    fn test_open_device_not_found() {
        let backend = SimBackend::new().with_device(keypad());
        let request = InterruptRequest::new(0xdead, 0xbeef, 0x81, 5);
        let device = InterruptDevice::open(&backend, request, empty_binding());

        assert!(matches!(
            device.error(),
            Some(DeviceError::DeviceNotFound {
                vendor_id: 0xdead,
                product_id: 0xbeef,
                source: rusb::Error::NotFound,
            })
        ));
        assert!(backend.is_idle());
    }

    #[test]
    fn test_open_unconfigured_device() {
        let backend = SimBackend::new().with_device(keypad().unconfigured());
        let device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        let err = device.error().unwrap();
        assert!(err.is_unconfigured());
        assert!(!device.has_config());
        assert!(backend.is_idle());
    }

    #[test]
    fn test_try_open_returns_error() {
        let backend = SimBackend::new().with_device(keypad());
        let result = InterruptDevice::try_open(&backend, request(0x99), empty_binding());

        assert_eq!(result.err(), Some(DeviceError::EndpointNotFound { address: 0x99 }));
        assert!(backend.is_idle());
    }
}

// ============================================================================
// Unwinding
// ============================================================================

mod unwinding {
    use super::*;

    fn open_with_failure(stage: SimStage, err: rusb::Error) -> (SimBackend, Option<DeviceError>) {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_failure(stage, err);
        let error = {
            let device = InterruptDevice::open(&backend, request(0x81), empty_binding());
            assert!(!device.has_handle());
            assert!(!device.has_config());
            assert!(!device.has_transfer());
            assert_eq!(device.interface(), None);
            device.error()
        };
        (backend, error)
    }

    #[test]
    fn test_failure_at_every_stage_leaks_nothing() {
        let cases = [
            (SimStage::Open, rusb::Error::Access),
            (SimStage::Config, rusb::Error::Io),
            (SimStage::Claim, rusb::Error::Busy),
            (SimStage::Alloc, rusb::Error::NoMem),
            (SimStage::Submit, rusb::Error::Pipe),
        ];

        for (stage, err) in cases {
            let (backend, error) = open_with_failure(stage, err);
            assert!(error.is_some(), "stage {:?} should fail", stage);
            assert!(backend.is_idle(), "stage {:?} leaked resources", stage);
        }
    }

    #[test]
    fn test_error_kinds_per_stage() {
        let (_, error) = open_with_failure(SimStage::Open, rusb::Error::Access);
        assert!(matches!(
            error,
            Some(DeviceError::DeviceNotFound {
                source: rusb::Error::Access,
                ..
            })
        ));

        let (_, error) = open_with_failure(SimStage::Config, rusb::Error::Io);
        assert_eq!(error, Some(DeviceError::DescriptorUnavailable(rusb::Error::Io)));

        let (_, error) = open_with_failure(SimStage::Claim, rusb::Error::Busy);
        assert_eq!(
            error,
            Some(DeviceError::InterfaceClaimFailed {
                interface: 0,
                source: rusb::Error::Busy
            })
        );

        let (_, error) = open_with_failure(SimStage::Alloc, rusb::Error::NoMem);
        assert_eq!(error, Some(DeviceError::TransferAllocFailed(rusb::Error::NoMem)));

        let (_, error) = open_with_failure(SimStage::Submit, rusb::Error::Pipe);
        assert_eq!(error, Some(DeviceError::SubmitFailed(rusb::Error::Pipe)));
    }

    #[test]
    fn test_zero_max_length_rejected() {
        let backend = SimBackend::new().with_device(keypad());
        let request = InterruptRequest::new(VID, PID, 0x81, 0);
        let device = InterruptDevice::open(&backend, request, empty_binding());

        assert_eq!(
            device.error(),
            Some(DeviceError::TransferAllocFailed(rusb::Error::InvalidParam))
        );
        assert_eq!(device.interface(), None);
        assert!(
            !backend
                .ledger()
                .iter()
                .any(|op| matches!(op, SimOp::TransferAlloc { .. }))
        );
        assert!(backend.ledger().contains(&SimOp::Release(0)));
        assert!(backend.is_idle());
    }

    #[test]
    fn test_submit_failure_unwinds_in_reverse() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_failure(SimStage::Submit, rusb::Error::Pipe);
        let _device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        let ledger = backend.ledger();
        let submit = ledger.iter().position(|op| *op == SimOp::Submit).unwrap();
        assert_eq!(
            &ledger[submit + 1..],
            &[
                SimOp::BufferFreed,
                SimOp::TransferFreed,
                SimOp::Release(0),
                SimOp::ConfigFreed,
                SimOp::Close,
            ]
        );
    }

    #[test]
    fn test_close_after_failed_open_changes_nothing() {
        let backend = SimBackend::new().with_device(keypad());
        let mut device = InterruptDevice::open(&backend, request(0x99), empty_binding());
        let before = backend.ledger();

        device.close();
        device.close();
        assert_eq!(backend.ledger(), before);
    }

    #[test]
    fn test_release_failure_does_not_stop_teardown() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_failure(SimStage::Release, rusb::Error::NoDevice);
        let mut device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        device.close();
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.live_configs(), 0);
        assert_eq!(backend.live_transfers(), 0);
    }
}

// ============================================================================
// Close
// ============================================================================

mod close {
    use super::*;

    #[test]
    fn test_close_is_idempotent() {
        let backend = SimBackend::new().with_device(keypad());
        let mut device = InterruptDevice::open(&backend, request(0x81), empty_binding());

        device.close();
        let after_first = backend.ledger();
        device.close();

        assert_eq!(backend.ledger(), after_first);
        assert!(backend.is_idle());
    }

    #[test]
    fn test_reopen_after_close() {
        let backend = SimBackend::new().with_device(keypad());

        let mut first = InterruptDevice::open(&backend, request(0x81), empty_binding());
        first.close();
        let second = InterruptDevice::open(&backend, request(0x81), empty_binding());

        assert_eq!(second.error(), None);
        assert_eq!(backend.claimed_interfaces(), vec![0]);
    }

    #[test]
    fn test_second_open_of_claimed_interface_fails() {
        let backend = SimBackend::new().with_device(keypad());

        let first = InterruptDevice::open(&backend, request(0x81), empty_binding());
        let second = InterruptDevice::open(&backend, request(0x81), empty_binding());

        assert_eq!(first.error(), None);
        assert!(matches!(
            second.error(),
            Some(DeviceError::InterfaceClaimFailed {
                source: rusb::Error::Busy,
                ..
            })
        ));
        assert_eq!(backend.claimed_interfaces(), vec![0]);
    }
}

// ============================================================================
// Transfer loop
// ============================================================================

mod transfer_loop {
    use super::*;

    #[test]
    fn test_three_completions_then_failure() {
        let backend = SimBackend::new().with_device(keypad()).with_events([
            SimEvent::Complete(vec![1]),
            SimEvent::Complete(vec![2, 2]),
            SimEvent::Complete(vec![3, 3, 3]),
            SimEvent::Fail(rusb::Error::Io),
        ]);
        let (binding, seen) = recording_binding();

        let err = listen(&backend, request(0x81), binding);

        assert_eq!(err, DeviceError::EventProcessingFailed(rusb::Error::Io));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[vec![1], vec![2, 2], vec![3, 3, 3]]
        );
        // initial submission plus one resubmission per completion
        assert_eq!(backend.submissions(), 4);
        assert!(backend.is_idle());
    }

    #[test]
    fn test_each_completion_followed_by_resubmission() {
        let backend = SimBackend::new().with_device(keypad()).with_events([
            SimEvent::Complete(vec![1]),
            SimEvent::Complete(vec![2]),
            SimEvent::Fail(rusb::Error::NoDevice),
        ]);

        let _ = listen(&backend, request(0x81), empty_binding());

        let ledger = backend.ledger();
        let pumps: Vec<usize> = ledger
            .iter()
            .enumerate()
            .filter(|(_, op)| **op == SimOp::HandleEvents)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pumps.len(), 3);
        assert_eq!(ledger[pumps[0] + 1], SimOp::Submit);
        assert_eq!(ledger[pumps[1] + 1], SimOp::Submit);
        assert_ne!(ledger[pumps[2] + 1], SimOp::Submit);
    }

    #[test]
    fn test_delivery_is_bounded_by_max_length() {
        let backend = SimBackend::new().with_device(keypad());
        let (binding, seen) = recording_binding();
        let mut device = InterruptDevice::open(
            &backend,
            InterruptRequest::new(VID, PID, 0x81, 3),
            binding,
        );

        backend.push_event(SimEvent::Complete(vec![1, 2, 3, 4, 5, 6]));
        backend.push_event(SimEvent::Complete(vec![7]));
        device.pump().unwrap();
        device.pump().unwrap();

        assert_eq!(seen.lock().unwrap().as_slice(), &[vec![1, 2, 3], vec![7]]);
    }

    #[test]
    fn test_no_delivery_without_pumping() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_events([SimEvent::Complete(vec![1])]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let binding = Arc::new(CallbackBinding::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let device = InterruptDevice::open(&backend, request(0x81), binding);
        assert!(device.is_streaming());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_can_inspect_its_binding() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_events([SimEvent::Complete(vec![1])]);
        let own: Arc<OnceLock<Weak<CallbackBinding>>> = Arc::new(OnceLock::new());
        let inner = Arc::clone(&own);
        let (tx, rx) = mpsc::channel();
        let binding = Arc::new(CallbackBinding::new(move |data: &[u8]| {
            let has_handler = inner
                .get()
                .and_then(Weak::upgrade)
                .is_some_and(|binding| binding.has_handler());
            tx.send((has_handler, data.to_vec())).unwrap();
        }));
        own.set(Arc::downgrade(&binding)).unwrap();

        let pumping = backend.clone();
        std::thread::spawn(move || {
            let mut device = InterruptDevice::open(&pumping, request(0x81), binding);
            device.pump().unwrap();
        });

        let (has_handler, data) = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pump blocked while the handler used its binding");
        assert!(has_handler);
        assert_eq!(data, vec![1]);
    }

    #[test]
    fn test_resubmission_failure_ends_listen() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_failure(SimStage::Resubmit, rusb::Error::NoDevice)
            .with_events([SimEvent::Complete(vec![1]), SimEvent::Complete(vec![2])]);
        let (binding, seen) = recording_binding();

        let err = listen(&backend, request(0x81), binding);

        assert_eq!(err, DeviceError::EventProcessingFailed(rusb::Error::NoDevice));
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert!(backend.is_idle());
    }

    #[test]
    fn test_listen_reports_open_failure() {
        let backend = SimBackend::new().with_device(keypad());
        let err = listen(&backend, request(0x99), empty_binding());

        assert_eq!(err, DeviceError::EndpointNotFound { address: 0x99 });
        assert!(!backend.ledger().contains(&SimOp::HandleEvents));
    }

    #[test]
    fn test_two_devices_share_one_backend() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_device(SimDevice::new(0x1111, 0x2222).with_interface(0, &[0x82]));
        let (first_binding, first_seen) = recording_binding();
        let (second_binding, second_seen) = recording_binding();

        let mut first = InterruptDevice::open(&backend, request(0x81), first_binding);
        let second = InterruptDevice::open(
            &backend,
            InterruptRequest::new(0x1111, 0x2222, 0x82, 5),
            second_binding,
        );
        assert_eq!(first.error(), None);
        assert_eq!(second.error(), None);

        // pumping one device drives completions for every device on the backend
        backend.push_event(SimEvent::Complete(vec![1]));
        first.pump().unwrap();

        let total = first_seen.lock().unwrap().len() + second_seen.lock().unwrap().len();
        assert_eq!(total, 1);
    }
}

// ============================================================================
// Boundary operations
// ============================================================================

mod boundary {
    use super::*;

    #[test]
    fn test_open_interrupt_and_close() {
        let backend = SimBackend::new().with_device(keypad());
        let mut device = open_interrupt(&backend, VID, PID, 0x81, 5, None);

        assert!(device.is_some());
        close_interrupt(device.as_mut());
        close_interrupt(device.as_mut());
        close_interrupt::<SimBackend>(None);
        assert!(backend.is_idle());
    }

    #[test]
    fn test_is_open_reports_recorded_error() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_events([SimEvent::Fail(rusb::Error::Io)]);
        let mut device = open_interrupt(&backend, VID, PID, 0x81, 5, None);

        assert!(!is_open(device.as_ref()));
        assert!(device.as_mut().unwrap().pump().is_err());
        assert!(is_open(device.as_ref()));
    }

    #[test]
    fn test_listen_blocking_exit_code() {
        let backend = SimBackend::new()
            .with_device(keypad())
            .with_events([SimEvent::Complete(vec![1]), SimEvent::Fail(rusb::Error::Io)]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let code = listen_blocking(
            &backend,
            VID,
            PID,
            0x81,
            5,
            Some(Box::new(move |_: &[u8]| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert_eq!(code, EXIT_FAILURE);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(backend.is_idle());
    }
}
