//! Protocol library for usb-relay
//!
//! This crate defines the envelope exchanged between the physical and virtual sides of
//! the proxy, the USB descriptor types carried inside it, and the device topology
//! snapshot sent when a device attaches.
//!
//! # Example
//!
//! ```
//! use protocol::{Direction, EndpointId, EndpointType, Message};
//! use protocol::{decode_message, encode_message};
//!
//! let ep = EndpointId::new(1, EndpointType::Bulk, Direction::In);
//! let msg = Message::data(ep, vec![0xaa, 0xbb]);
//!
//! let bytes = encode_message(&msg).unwrap();
//! let decoded = decode_message(&bytes).unwrap();
//! assert_eq!(decoded, msg);
//! ```
//!
//! # Device Topology
//!
//! ```
//! use protocol::{DeviceIdentity, DeviceSpeed};
//!
//! let device = [18, 1, 0, 2, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0, 1, 0, 0, 0, 1];
//! let config = [9, 2, 9, 0, 0, 1, 0, 0x80, 50];
//! let identity = DeviceIdentity::from_raw(DeviceSpeed::High, &device, &config).unwrap();
//! assert!(identity.interfaces.is_empty());
//! ```

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod identity;
pub mod messages;
pub mod types;

pub use codec::{
    ENDPOINT_ID_SIZE, HEADER_SIZE, MAX_MESSAGE_SIZE, STATUS_SIZE, decode_message, encode_message,
    encoded_len,
};
pub use descriptor::{
    ConfigDescriptor, DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor, SetupPacket,
};
pub use error::{ProtocolError, Result};
pub use identity::{
    DeviceIdentity, InterfaceSetting, MAX_ENDPOINTS_PER_INTERFACE, MAX_INTERFACES,
};
pub use messages::{ManagementKind, Message, MessageKind};
pub use types::{
    DeviceSpeed, Direction, EndpointId, EndpointType, STATUS_SUCCESS, TransferError, status_code,
};
