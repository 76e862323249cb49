//! USB device access through rusb

pub mod device;
pub mod port;
pub mod transfers;

pub use device::{
    DeviceSummary, OpenedDevice, find_device, isochronous_endpoints, list_devices, open_device,
};
pub use port::RusbPort;
