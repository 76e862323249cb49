//! Gadget Service Tests
//!
//! Starts the gadget side on a loopback socket and talks to it the way the
//! physical side does.
//!
//! Run with: `cargo test -p gadget --test service_tests`

use common::test_utils::{MockPort, bulk_in_identity, eventually};
use common::{
    DatagramSink, RequestHandle, Result, Transfer, TransportConfig, UdpTransport, UsbPort,
};
use gadget::{GadgetBackend, GadgetConfig, GadgetService, SetupHandler};
use protocol::{
    DeviceIdentity, EndpointId, ManagementKind, Message, TransferError, encode_message,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct HostBackend {
    port: MockPort,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl UsbPort for HostBackend {
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

impl GadgetBackend for HostBackend {
    fn register(&self, identity: &DeviceIdentity, _on_setup: SetupHandler) -> Result<()> {
        *self.identity.lock().unwrap() = Some(identity.clone());
        Ok(())
    }

    fn unregister(&self) {
        *self.identity.lock().unwrap() = None;
    }
}

fn loopback_config() -> GadgetConfig {
    let mut config = GadgetConfig::default();
    config.transport.bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    config
}

#[tokio::test]
async fn test_announcement_over_udp_registers_gadget() {
    let backend = Arc::new(HostBackend::default());
    let service = GadgetService::start(&loopback_config(), backend.clone())
        .await
        .unwrap();

    let mut physical = TransportConfig::physical_default();
    physical.bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
    physical.peer = Some(service.local_addr().unwrap());
    let (sender, _inbound, _task) = UdpTransport::open(&physical).await.unwrap();

    let identity = bulk_in_identity();
    let announce = Message::management(ManagementKind::NewDevice, identity.to_payload().unwrap());
    sender
        .send_datagram(&encode_message(&announce).unwrap())
        .unwrap();

    eventually(|| service.adapter().is_registered()).await;
    assert_eq!(*backend.identity.lock().unwrap(), Some(identity));

    service.shutdown();
    assert!(backend.identity.lock().unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_config_is_refused() {
    let mut config = loopback_config();
    config.log_level = "loud".to_string();

    let result = GadgetService::start(&config, Arc::new(HostBackend::default())).await;
    assert!(result.is_err());
}
