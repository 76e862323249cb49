//! Transport Channel Tests
//!
//! # Test Scenarios
//! - Ordered delivery of decoded messages
//! - Malformed datagrams are dropped without stopping delivery
//! - Two adapters connected back to back through loopback sinks
//!
//! Run with: `cargo test -p common --test channel_tests`

use bytes::Bytes;
use common::test_utils::{
    DEFAULT_TEST_TIMEOUT, LoopbackSink, MockPort, bulk_in_identity, eventually, with_timeout,
};
use common::{AdapterCore, Channel, Side, create_datagram_queue, spawn_delivery};
use protocol::{Direction, EndpointId, EndpointType, ManagementKind, Message, encode_message};

const EP1_IN: EndpointId = EndpointId::new(1, EndpointType::Bulk, Direction::In);

#[tokio::test]
async fn test_delivery_preserves_order_and_skips_invalid() {
    let (inlet, inbound) = create_datagram_queue();
    let (tx, rx) = async_channel::unbounded();
    let task = spawn_delivery("test", inbound, move |message| {
        let _ = tx.try_send(message);
    });

    let first = Message::data(EP1_IN, vec![1]);
    let second = Message::management(ManagementKind::Reload, Vec::new());
    inlet
        .deliver(Bytes::from(encode_message(&first).unwrap()))
        .unwrap();
    // Unknown kind
    inlet
        .deliver(Bytes::from_static(&[9, 0, 0, 0, 0, 0, 0, 0, 7]))
        .unwrap();
    // Truncated header
    inlet.deliver(Bytes::from_static(&[1, 2])).unwrap();
    inlet
        .deliver(Bytes::from(encode_message(&second).unwrap()))
        .unwrap();
    drop(inlet);

    with_timeout(DEFAULT_TEST_TIMEOUT, task)
        .await
        .unwrap()
        .unwrap();
    let received: Vec<Message> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
    assert_eq!(received, vec![first, second]);
}

#[tokio::test]
async fn test_back_to_back_adapters() {
    // physical -> virtual
    let (virtual_inlet, virtual_inbound) = create_datagram_queue();
    let to_virtual = LoopbackSink::new(virtual_inlet);

    let physical_port = MockPort::new();
    let physical = AdapterCore::new(
        Side::Physical,
        physical_port.clone(),
        Channel::new("physical", to_virtual.clone()),
    );
    physical.install_identity(bulk_in_identity());
    physical.restore_default_interfaces().unwrap();

    let (tx, rx) = async_channel::unbounded();
    let _delivery = spawn_delivery("virtual", virtual_inbound, move |message| {
        let _ = tx.try_send(message);
    });

    assert!(physical_port.complete(EP1_IN, Ok(2), vec![0xaa, 0xbb, 0, 0]));
    eventually(|| rx.len() == 1).await;

    assert_eq!(rx.try_recv().unwrap(), Message::data(EP1_IN, vec![0xaa, 0xbb]));
    assert_eq!(to_virtual.messages().len(), 1);
    eventually(|| physical_port.submissions(EP1_IN) == 2).await;
}
