//! Physical side of usb-relay
//!
//! Attaches to a real USB device, announces its topology to the peer and relays
//! transfers between the device and the datagram channel.

pub mod adapter;
pub mod config;
pub mod usb;

pub use adapter::PhysicalAdapter;
pub use config::PhysicalConfig;
