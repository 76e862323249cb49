//! Test utilities for usb-relay
//!
//! Provides a scripted [`UsbPort`], datagram sinks that record or loop back what
//! they are sent, topology builders and async helpers shared by the crates' tests.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{bulk_in_identity, setup_packet};
//!
//! let identity = bulk_in_identity();
//! assert_eq!(identity.interfaces.len(), 1);
//!
//! let setup = setup_packet(0x80, 0x06, 0x0100, 0, 18);
//! assert_eq!(setup.length, 18);
//! ```

use crate::channel::{DatagramInlet, DatagramSink};
use crate::endpoint::lock;
use crate::port::{RequestHandle, Transfer, TransferResult, UsbPort};
use bytes::Bytes;
use protocol::{
    ConfigDescriptor, DeviceDescriptor, DeviceIdentity, DeviceSpeed, Direction,
    EndpointDescriptor, EndpointId, EndpointType, InterfaceDescriptor, InterfaceSetting, Message,
    SetupPacket, TransferError, decode_message,
};
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout wrapper for async tests
///
/// # Example
/// ```ignore
/// use common::test_utils::{with_timeout, DEFAULT_TEST_TIMEOUT};
///
/// #[tokio::test]
/// async fn test_with_timeout() {
///     let result = with_timeout(DEFAULT_TEST_TIMEOUT, async { 42 }).await.unwrap();
///     assert_eq!(result, 42);
/// }
/// ```
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// Poll `condition` until it holds, giving endpoint workers time to run
///
/// Panics after [`DEFAULT_TEST_TIMEOUT`].
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    if let Err(e) = with_timeout(DEFAULT_TEST_TIMEOUT, poll).await {
        panic!("condition not met: {}", e);
    }
}

/// Operation observed by a [`MockPort`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortCall {
    Submit {
        endpoint: EndpointId,
        handle: RequestHandle,
        length: usize,
    },
    Cancel {
        endpoint: EndpointId,
        handle: RequestHandle,
    },
    ClearHalt(EndpointId),
    SetHalt(EndpointId),
    SetInterface {
        interface: u8,
        alternate: u8,
    },
}

/// Port that parks submitted transfers until a test completes them
#[derive(Debug, Default)]
pub struct MockPort {
    calls: Mutex<Vec<PortCall>>,
    pending: Mutex<Vec<Transfer>>,
    rejected: Mutex<Vec<EndpointType>>,
}

impl MockPort {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<PortCall> {
        lock(&self.calls).clone()
    }

    /// Number of recorded calls equal to `call`
    pub fn count(&self, call: &PortCall) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    /// Number of transfers ever submitted on `endpoint`
    pub fn submissions(&self, endpoint: EndpointId) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, PortCall::Submit { endpoint: e, .. } if *e == endpoint))
            .count()
    }

    /// Number of transfers parked on `endpoint`
    pub fn pending(&self, endpoint: EndpointId) -> usize {
        lock(&self.pending)
            .iter()
            .filter(|t| t.endpoint == endpoint)
            .count()
    }

    /// Remove the oldest parked transfer on `endpoint`
    pub fn take_pending(&self, endpoint: EndpointId) -> Option<Transfer> {
        let mut pending = lock(&self.pending);
        let index = pending.iter().position(|t| t.endpoint == endpoint)?;
        Some(pending.remove(index))
    }

    /// Complete the oldest parked transfer on `endpoint`; false if none is parked
    pub fn complete(&self, endpoint: EndpointId, result: TransferResult, data: Vec<u8>) -> bool {
        match self.take_pending(endpoint) {
            Some(transfer) => {
                transfer.complete(result, data);
                true
            }
            None => false,
        }
    }

    /// Fail every later submission of this transfer type with `NotSupported`
    pub fn reject_type(&self, kind: EndpointType) {
        lock(&self.rejected).push(kind);
    }
}

impl UsbPort for MockPort {
    fn submit(&self, transfer: Transfer) -> Result<(), TransferError> {
        if lock(&self.rejected).contains(&transfer.endpoint.kind) {
            return Err(TransferError::NotSupported);
        }
        lock(&self.calls).push(PortCall::Submit {
            endpoint: transfer.endpoint,
            handle: transfer.handle,
            length: transfer.length(),
        });
        lock(&self.pending).push(transfer);
        Ok(())
    }

    fn cancel(&self, endpoint: EndpointId, handle: RequestHandle) {
        lock(&self.calls).push(PortCall::Cancel { endpoint, handle });
        let transfer = {
            let mut pending = lock(&self.pending);
            pending
                .iter()
                .position(|t| t.handle == handle)
                .map(|index| pending.remove(index))
        };
        if let Some(transfer) = transfer {
            transfer.complete(Err(TransferError::Canceled), Vec::new());
        }
    }

    fn clear_halt(&self, endpoint: EndpointId) -> Result<(), TransferError> {
        lock(&self.calls).push(PortCall::ClearHalt(endpoint));
        Ok(())
    }

    fn set_halt(&self, endpoint: EndpointId) -> Result<(), TransferError> {
        lock(&self.calls).push(PortCall::SetHalt(endpoint));
        Ok(())
    }

    fn set_interface(&self, interface: u8, alternate: u8) -> Result<(), TransferError> {
        lock(&self.calls).push(PortCall::SetInterface {
            interface,
            alternate,
        });
        Ok(())
    }
}

/// Sink that decodes and keeps every datagram it is given
#[derive(Debug, Default)]
pub struct RecordingSink {
    messages: Mutex<Vec<Message>>,
    disconnected: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sink that fails every send as if no peer were known
    pub fn disconnected() -> Arc<Self> {
        let sink = Self::default();
        sink.disconnected.store(true, Ordering::SeqCst);
        Arc::new(sink)
    }

    pub fn messages(&self) -> Vec<Message> {
        lock(&self.messages).clone()
    }

    pub fn take(&self) -> Vec<Message> {
        std::mem::take(&mut *lock(&self.messages))
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, datagram: &[u8]) -> io::Result<usize> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::NotConnected));
        }
        let message = decode_message(datagram)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        lock(&self.messages).push(message);
        Ok(datagram.len())
    }
}

impl DatagramSink for RecordingSink {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        self.record(datagram)
    }
}

/// Sink that records each datagram and feeds it to another side's inbound queue
#[derive(Debug)]
pub struct LoopbackSink {
    inlet: DatagramInlet,
    recorded: RecordingSink,
}

impl LoopbackSink {
    pub fn new(inlet: DatagramInlet) -> Arc<Self> {
        Arc::new(Self {
            inlet,
            recorded: RecordingSink::default(),
        })
    }

    pub fn messages(&self) -> Vec<Message> {
        self.recorded.messages()
    }
}

impl DatagramSink for LoopbackSink {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        let sent = self.recorded.record(datagram)?;
        self.inlet
            .deliver(Bytes::copy_from_slice(datagram))
            .map_err(io::Error::other)?;
        Ok(sent)
    }
}

/// Build a setup packet
pub fn setup_packet(request_type: u8, request: u8, value: u16, index: u16, length: u16) -> SetupPacket {
    SetupPacket {
        request_type,
        request,
        value,
        index,
        length,
    }
}

/// Control Data message carrying `setup` followed by `data`
pub fn control_data(setup: SetupPacket, data: &[u8]) -> Message {
    let mut payload = setup.to_bytes().to_vec();
    payload.extend_from_slice(data);
    Message::data(EndpointId::control(setup.direction()), payload)
}

/// Alt-setting with the given endpoints
pub fn interface_setting(
    interface: u8,
    alternate: u8,
    endpoints: Vec<EndpointDescriptor>,
) -> InterfaceSetting {
    let mut setting = InterfaceSetting::new(InterfaceDescriptor {
        interface_number: interface,
        alternate_setting: alternate,
        num_endpoints: endpoints.len() as u8,
        class: 0xff,
        subclass: 0,
        protocol: 0,
        interface_index: 0,
    });
    setting.endpoints = endpoints;
    setting
}

/// High-speed vendor device with the given alt-settings
pub fn identity_with(interfaces: Vec<InterfaceSetting>) -> DeviceIdentity {
    let mut numbers: Vec<u8> = interfaces.iter().map(|s| s.number()).collect();
    numbers.dedup();

    DeviceIdentity {
        speed: DeviceSpeed::High,
        device: DeviceDescriptor {
            usb_version: 0x0200,
            class: 0,
            subclass: 0,
            protocol: 0,
            max_packet_size0: 64,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_version: 0x0100,
            manufacturer_index: 1,
            product_index: 2,
            serial_index: 3,
            num_configurations: 1,
        },
        config: ConfigDescriptor {
            total_length: 0,
            num_interfaces: numbers.len() as u8,
            configuration_value: 1,
            configuration_index: 0,
            attributes: 0x80,
            max_power: 50,
        },
        interfaces,
    }
}

/// Bulk endpoint 1 In
pub fn bulk_in() -> EndpointDescriptor {
    EndpointDescriptor::new(EndpointId::new(1, EndpointType::Bulk, Direction::In), 512, 0)
}

/// Device with one interface holding bulk endpoint 1 In
pub fn bulk_in_identity() -> DeviceIdentity {
    identity_with(vec![interface_setting(0, 0, vec![bulk_in()])])
}
