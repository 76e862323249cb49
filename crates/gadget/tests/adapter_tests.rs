//! Virtual Adapter Tests
//!
//! # Test Scenarios
//! - Device announcements register the gadget and build its endpoints
//! - Malformed announcements and backend failures leave the adapter unregistered
//! - Reset withdraws the device; later traffic is rejected
//! - Host setup requests reach endpoint 0
//!
//! Run with: `cargo test -p gadget --test adapter_tests`

use common::test_utils::{
    MockPort, RecordingSink, bulk_in_identity, eventually, identity_with, interface_setting,
    setup_packet,
};
use common::{Channel, Error, RequestHandle, Result, Transfer, UsbPort};
use gadget::{GadgetBackend, SetupHandler, VirtualAdapter};
use protocol::descriptor::{DT_DEVICE, REQ_GET_DESCRIPTOR};
use protocol::{
    DeviceIdentity, Direction, EndpointDescriptor, EndpointId, EndpointType, ManagementKind,
    Message, TransferError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const EP1_IN: EndpointId = EndpointId::new(1, EndpointType::Bulk, Direction::In);
const EP2_OUT: EndpointId = EndpointId::new(2, EndpointType::Bulk, Direction::Out);
const CONTROL_IN: EndpointId = EndpointId::control(Direction::In);

/// Backend that records registrations and parks transfers on a [`MockPort`]
#[derive(Default)]
struct MockBackend {
    port: MockPort,
    registered: Mutex<Option<(DeviceIdentity, SetupHandler)>>,
    unregisters: AtomicUsize,
    fail_register: AtomicBool,
}

impl MockBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn identity(&self) -> Option<DeviceIdentity> {
        self.registered
            .lock()
            .unwrap()
            .as_ref()
            .map(|(identity, _)| identity.clone())
    }

    fn host_setup(&self, request: u8, value: u16, length: u16) {
        let handler = self.registered.lock().unwrap().as_ref().unwrap().1.clone();
        handler(setup_packet(0x80, request, value, 0, length));
    }
}

impl UsbPort for MockBackend {
    fn submit(&self, transfer: Transfer) -> std::result::Result<(), TransferError> {
        self.port.submit(transfer)
    }

    fn cancel(&self, endpoint: EndpointId, handle: RequestHandle) {
        self.port.cancel(endpoint, handle)
    }

    fn clear_halt(&self, endpoint: EndpointId) -> std::result::Result<(), TransferError> {
        self.port.clear_halt(endpoint)
    }

    fn set_halt(&self, endpoint: EndpointId) -> std::result::Result<(), TransferError> {
        self.port.set_halt(endpoint)
    }
}

impl GadgetBackend for MockBackend {
    fn register(&self, identity: &DeviceIdentity, on_setup: SetupHandler) -> Result<()> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(Error::Registration("gadget function busy".to_string()));
        }
        *self.registered.lock().unwrap() = Some((identity.clone(), on_setup));
        Ok(())
    }

    fn unregister(&self) {
        self.unregisters.fetch_add(1, Ordering::SeqCst);
        *self.registered.lock().unwrap() = None;
    }
}

fn adapter() -> (Arc<VirtualAdapter>, Arc<MockBackend>, Arc<RecordingSink>) {
    let backend = MockBackend::new();
    let sink = RecordingSink::new();
    let adapter = VirtualAdapter::new(backend.clone(), Channel::new("virtual", sink.clone()));
    (adapter, backend, sink)
}

fn new_device(identity: &DeviceIdentity) -> Message {
    Message::management(ManagementKind::NewDevice, identity.to_payload().unwrap())
}

// ============================================================================
// Registration
// ============================================================================

mod registration {
    use super::*;

    #[tokio::test]
    async fn test_new_device_registers() {
        let (adapter, backend, _sink) = adapter();
        let identity = bulk_in_identity();

        adapter.handle_message(new_device(&identity)).unwrap();

        assert!(adapter.is_registered());
        assert_eq!(backend.identity(), Some(identity.clone()));
        assert_eq!(adapter.core().identity().unwrap().device, identity.device);

        let registry = adapter.core().registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.contains(EndpointId::control(Direction::In)));
        assert!(registry.contains(EndpointId::control(Direction::Out)));
        assert!(registry.contains(EP1_IN));

        // In is answered on demand, never primed
        assert_eq!(backend.port.submissions(EP1_IN), 0);
    }

    #[tokio::test]
    async fn test_out_endpoints_are_primed() {
        let (adapter, backend, _sink) = adapter();
        let identity = identity_with(vec![interface_setting(
            0,
            0,
            vec![EndpointDescriptor::new(EP2_OUT, 512, 0)],
        )]);

        adapter.handle_message(new_device(&identity)).unwrap();
        assert_eq!(backend.port.pending(EP2_OUT), 1);
    }

    #[tokio::test]
    async fn test_malformed_announcement() {
        let (adapter, backend, _sink) = adapter();

        let result =
            adapter.handle_message(Message::management(ManagementKind::NewDevice, vec![3, 0]));
        assert!(matches!(result, Err(Error::Protocol(_))));
        assert!(!adapter.is_registered());
        assert!(backend.identity().is_none());
        assert!(adapter.core().registry().is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure() {
        let (adapter, backend, _sink) = adapter();
        backend.fail_register.store(true, Ordering::SeqCst);

        let result = adapter.handle_message(new_device(&bulk_in_identity()));
        assert!(matches!(result, Err(Error::Registration(_))));
        assert!(!adapter.is_registered());
        assert!(adapter.core().registry().is_empty());
        assert!(adapter.core().identity().is_none());
    }

    #[tokio::test]
    async fn test_second_announcement_replaces_device() {
        let (adapter, backend, _sink) = adapter();
        adapter.handle_message(new_device(&bulk_in_identity())).unwrap();

        let replacement = identity_with(vec![interface_setting(
            0,
            0,
            vec![EndpointDescriptor::new(EP2_OUT, 512, 0)],
        )]);
        adapter.handle_message(new_device(&replacement)).unwrap();

        assert_eq!(backend.unregisters.load(Ordering::SeqCst), 1);
        assert_eq!(backend.identity(), Some(replacement));
        assert!(!adapter.core().registry().contains(EP1_IN));
        assert!(adapter.core().registry().contains(EP2_OUT));
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

mod lifecycle {
    use super::*;

    #[tokio::test]
    async fn test_traffic_before_registration_rejected() {
        let (adapter, _backend, _sink) = adapter();

        let result = adapter.handle_message(Message::data(EP1_IN, vec![1, 2]));
        assert!(matches!(result, Err(Error::NotRegistered)));
        let result = adapter.handle_message(Message::ack(EP1_IN, 0, Vec::new()));
        assert!(matches!(result, Err(Error::NotRegistered)));
    }

    #[tokio::test]
    async fn test_reset_withdraws_device() {
        let (adapter, backend, _sink) = adapter();
        adapter.handle_message(new_device(&bulk_in_identity())).unwrap();

        adapter.handle_message(Message::reset()).unwrap();

        assert!(!adapter.is_registered());
        assert_eq!(backend.unregisters.load(Ordering::SeqCst), 1);
        assert!(adapter.core().registry().is_empty());
        assert!(matches!(
            adapter.handle_message(Message::data(EP1_IN, vec![1])),
            Err(Error::NotRegistered)
        ));

        // Nothing left to withdraw
        adapter.handle_message(Message::reset()).unwrap();
        assert_eq!(backend.unregisters.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reload_ignored() {
        let (adapter, backend, sink) = adapter();
        adapter.handle_message(new_device(&bulk_in_identity())).unwrap();

        adapter
            .handle_message(Message::management(ManagementKind::Reload, Vec::new()))
            .unwrap();
        assert!(adapter.is_registered());
        assert_eq!(backend.unregisters.load(Ordering::SeqCst), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_peer_data_answers_host_read() {
        let (adapter, backend, _sink) = adapter();
        adapter.handle_message(new_device(&bulk_in_identity())).unwrap();

        adapter
            .handle_message(Message::data(EP1_IN, vec![0xaa, 0xbb]))
            .unwrap();
        eventually(|| backend.port.pending(EP1_IN) == 1).await;

        let transfer = backend.port.take_pending(EP1_IN).unwrap();
        assert_eq!(transfer.buffer, vec![0xaa, 0xbb]);
    }
}

// ============================================================================
// Host setup requests
// ============================================================================

mod setup {
    use super::*;

    #[tokio::test]
    async fn test_setup_forwarded_to_peer() {
        let (adapter, backend, sink) = adapter();
        adapter.handle_message(new_device(&bulk_in_identity())).unwrap();

        backend.host_setup(REQ_GET_DESCRIPTOR, u16::from(DT_DEVICE) << 8, 18);
        eventually(|| sink.len() == 1).await;

        let setup = setup_packet(0x80, REQ_GET_DESCRIPTOR, u16::from(DT_DEVICE) << 8, 0, 18);
        assert_eq!(
            sink.messages(),
            vec![Message::data(CONTROL_IN, setup.to_bytes().to_vec())]
        );
    }

    #[tokio::test]
    async fn test_setup_while_unregistered() {
        let (adapter, _backend, sink) = adapter();
        let setup = setup_packet(0x80, REQ_GET_DESCRIPTOR, u16::from(DT_DEVICE) << 8, 0, 18);

        assert!(matches!(
            adapter.handle_setup(setup),
            Err(Error::NotRegistered)
        ));
        assert!(sink.is_empty());
    }
}
