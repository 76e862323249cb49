//! Shared transfer-proxy engine for usb-relay
//!
//! Both proxy sides are built from the pieces in this crate: a datagram
//! [`Channel`] to the peer, a [`UsbPort`] for the local USB leg, an
//! [`EndpointRegistry`] of per-endpoint task queues and the per-type transfer
//! state machines, tied together by an [`AdapterCore`].

pub mod adapter;
pub mod channel;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod port;
pub mod registry;
pub mod test_utils;
pub mod transfer;
pub mod udp;

pub use adapter::{AdapterCore, Side};
pub use channel::{
    Channel, DatagramInlet, DatagramSink, INBOUND_QUEUE_CAPACITY, create_datagram_queue,
    spawn_delivery,
};
pub use config::TransportConfig;
pub use endpoint::{Endpoint, EndpointEvent, EndpointState, TransferRequest};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use port::{Completer, Completion, RequestHandle, Transfer, TransferResult, UsbPort};
pub use registry::EndpointRegistry;
pub use transfer::{Behavior, TransferMachine};
pub use udp::UdpTransport;
