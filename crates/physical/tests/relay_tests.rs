//! End-to-End Relay Tests
//!
//! Connects a physical adapter and a virtual adapter back to back through
//! loopback sinks and drives both USB legs with scripted ports.
//!
//! Run with: `cargo test -p physical --test relay_tests`

use common::test_utils::{LoopbackSink, MockPort, bulk_in_identity, eventually};
use common::{
    Channel, RequestHandle, Result, Transfer, UsbPort, create_datagram_queue, spawn_delivery,
};
use gadget::{GadgetBackend, SetupHandler, VirtualAdapter};
use physical::PhysicalAdapter;
use protocol::{
    DeviceIdentity, Direction, EndpointId, EndpointType, Message, MessageKind, TransferError,
};
use std::sync::{Arc, Mutex};

const EP1_IN: EndpointId = EndpointId::new(1, EndpointType::Bulk, Direction::In);

/// Gadget backend parking host transfers on a [`MockPort`]
#[derive(Default)]
struct HostPort {
    port: MockPort,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl UsbPort for HostPort {
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

impl GadgetBackend for HostPort {
    fn register(&self, identity: &DeviceIdentity, _on_setup: SetupHandler) -> Result<()> {
        *self.identity.lock().unwrap() = Some(identity.clone());
        Ok(())
    }

    fn unregister(&self) {
        *self.identity.lock().unwrap() = None;
    }
}

struct Relay {
    physical: Arc<PhysicalAdapter>,
    device: Arc<MockPort>,
    gadget: Arc<VirtualAdapter>,
    host: Arc<HostPort>,
    to_virtual: Arc<LoopbackSink>,
    to_physical: Arc<LoopbackSink>,
}

fn relay() -> Relay {
    let (virtual_inlet, virtual_inbound) = create_datagram_queue();
    let (physical_inlet, physical_inbound) = create_datagram_queue();
    let to_virtual = LoopbackSink::new(virtual_inlet);
    let to_physical = LoopbackSink::new(physical_inlet);

    let device = MockPort::new();
    let physical =
        PhysicalAdapter::new(device.clone(), Channel::new("physical", to_virtual.clone()));

    let host = Arc::new(HostPort::default());
    let gadget = VirtualAdapter::new(host.clone(), Channel::new("virtual", to_physical.clone()));

    let handler = physical.clone();
    spawn_delivery("physical", physical_inbound, move |message| {
        let _ = handler.handle_message(message);
    });
    let handler = gadget.clone();
    spawn_delivery("virtual", virtual_inbound, move |message| {
        let _ = handler.handle_message(message);
    });

    Relay {
        physical,
        device,
        gadget,
        host,
        to_virtual,
        to_physical,
    }
}

fn data_count(messages: &[Message]) -> usize {
    messages
        .iter()
        .filter(|m| m.kind() == MessageKind::Data)
        .count()
}

#[tokio::test]
async fn test_bulk_in_reaches_host() {
    let r = relay();
    let identity = bulk_in_identity();

    r.physical.attach(identity.clone()).unwrap();
    eventually(|| r.gadget.core().registry().contains(EP1_IN)).await;
    assert!(r.gadget.is_registered());
    assert_eq!(*r.host.identity.lock().unwrap(), Some(identity));

    let mut drained = vec![0; 2048];
    drained[..2].copy_from_slice(&[0xaa, 0xbb]);
    assert!(r.device.complete(EP1_IN, Ok(2), drained));

    eventually(|| r.host.port.pending(EP1_IN) == 1).await;
    let transfer = r.host.port.take_pending(EP1_IN).unwrap();
    assert_eq!(transfer.buffer, vec![0xaa, 0xbb]);
    assert_eq!(data_count(&r.to_virtual.messages()), 1);

    // The host read completes and the physical side hears about it
    transfer.complete(Ok(2), Vec::new());
    eventually(|| !r.to_physical.messages().is_empty()).await;
    assert_eq!(
        r.to_physical.messages(),
        vec![Message::ack(EP1_IN, 0, Vec::new())]
    );

    // The device endpoint keeps draining
    eventually(|| r.device.submissions(EP1_IN) == 2).await;
}

#[tokio::test]
async fn test_detach_withdraws_gadget() {
    let r = relay();
    r.physical.attach(bulk_in_identity()).unwrap();
    eventually(|| r.gadget.core().registry().contains(EP1_IN)).await;

    r.physical.detach();
    eventually(|| r.gadget.core().registry().is_empty()).await;

    assert!(!r.gadget.is_registered());
    assert!(r.host.identity.lock().unwrap().is_none());
}
