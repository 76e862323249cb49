//! Device discovery and topology capture
//!
//! Opens the device to relay, takes it away from kernel drivers and reads the
//! raw device and configuration descriptors that make up its [`DeviceIdentity`].

use super::transfers::{DEFAULT_TIMEOUT, map_rusb_error};
use crate::config::filter_matches;
use common::{Error, Result};
use protocol::descriptor::{DT_CONFIG, DT_DEVICE, REQ_GET_DESCRIPTOR};
use protocol::{
    ConfigDescriptor, DeviceDescriptor, DeviceIdentity, DeviceSpeed, EndpointId, EndpointType,
};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use tracing::{debug, info, warn};

/// Hub device class
const CLASS_HUB: u8 = 0x09;

/// Device-to-host, standard, device recipient
const REQ_TYPE_DEVICE_IN: u8 = 0x80;

/// Short listing of an attached device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub device_address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub speed: DeviceSpeed,
    pub product: Option<String>,
}

impl std::fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x} {:?}",
            self.bus_number, self.device_address, self.vendor_id, self.product_id, self.speed
        )?;
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        Ok(())
    }
}

/// A device opened for relaying
pub struct OpenedDevice {
    pub handle: DeviceHandle<Context>,
    /// Interfaces claimed from the kernel
    pub claimed: Vec<u8>,
    pub identity: DeviceIdentity,
}

/// List every device on the bus
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>> {
    let devices = context.devices().map_err(registration)?;
    let mut summaries = Vec::new();

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!("Skipping device without descriptor: {}", e);
                continue;
            }
        };

        let product = device.open().ok().and_then(|handle| {
            descriptor
                .product_string_index()
                .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
        });

        summaries.push(DeviceSummary {
            bus_number: device.bus_number(),
            device_address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            class: descriptor.class_code(),
            speed: map_device_speed(device.speed()),
            product,
        });
    }

    Ok(summaries)
}

/// Find the device to relay: the first match of `filter`, or the first non-hub
pub fn find_device(context: &Context, filter: Option<&str>) -> Result<Device<Context>> {
    let devices = context.devices().map_err(registration)?;

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        let selected = match filter {
            Some(filter) => {
                filter_matches(filter, descriptor.vendor_id(), descriptor.product_id())
            }
            None => descriptor.class_code() != CLASS_HUB,
        };
        if selected {
            info!(
                "Selected device {:04x}:{:04x} on bus {} address {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                device.bus_number(),
                device.address()
            );
            return Ok(device);
        }
    }

    Err(Error::Registration(match filter {
        Some(filter) => format!("No device matches filter '{}'", filter),
        None => "No USB device found".to_string(),
    }))
}

/// Open a device, claim every interface of its active configuration and capture its topology
///
/// Kernel drivers are detached first. Claimed interfaces are released again if a later
/// step fails.
pub fn open_device(device: &Device<Context>) -> Result<OpenedDevice> {
    let mut handle = device.open().map_err(|e| {
        warn!("Failed to open device: {}", e);
        registration(e)
    })?;

    let config = device.active_config_descriptor().map_err(|e| {
        warn!("Failed to get active config descriptor: {}", e);
        registration(e)
    })?;

    let mut claimed = Vec::new();
    for interface in config.interfaces() {
        let number = interface.number();

        match handle.kernel_driver_active(number) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", number);
                if let Err(e) = handle.detach_kernel_driver(number) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        number, e
                    );
                }
            }
            Ok(false) => debug!("No kernel driver active on interface {}", number),
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                number, e
            ),
        }

        if let Err(e) = handle.claim_interface(number) {
            warn!("Failed to claim interface {}: {}", number, e);
            release(&mut handle, &claimed);
            return Err(Error::Registration(format!(
                "Failed to claim interface {}: {}",
                number, e
            )));
        }
        debug!("Claimed interface {}", number);
        claimed.push(number);
    }

    match read_identity(device, &handle) {
        Ok(identity) => Ok(OpenedDevice {
            handle,
            claimed,
            identity,
        }),
        Err(e) => {
            release(&mut handle, &claimed);
            Err(e)
        }
    }
}

/// Read the raw device descriptor and the active configuration block
pub fn read_identity(device: &Device<Context>, handle: &DeviceHandle<Context>) -> Result<DeviceIdentity> {
    let mut raw_device = vec![0u8; DeviceDescriptor::SIZE];
    let len = get_descriptor(handle, DT_DEVICE, 0, &mut raw_device)?;
    raw_device.truncate(len);

    let index = active_config_index(device, handle)?;
    let mut header = vec![0u8; ConfigDescriptor::SIZE];
    let len = get_descriptor(handle, DT_CONFIG, index, &mut header)?;
    let total_length = ConfigDescriptor::parse(&header[..len])?.total_length;

    let mut raw_config = vec![0u8; usize::from(total_length)];
    let len = get_descriptor(handle, DT_CONFIG, index, &mut raw_config)?;
    raw_config.truncate(len);

    let identity =
        DeviceIdentity::from_raw(map_device_speed(device.speed()), &raw_device, &raw_config)?;
    info!(
        "Captured topology of {:04x}:{:04x}: {} interface settings",
        identity.device.vendor_id,
        identity.device.product_id,
        identity.interfaces.len()
    );
    Ok(identity)
}

/// Descriptor index of the active configuration
fn active_config_index(device: &Device<Context>, handle: &DeviceHandle<Context>) -> Result<u8> {
    let active = handle.active_configuration().map_err(registration)?;
    let count = device
        .device_descriptor()
        .map_err(registration)?
        .num_configurations();

    for index in 0..count {
        if device
            .config_descriptor(index)
            .is_ok_and(|config| config.number() == active)
        {
            return Ok(index);
        }
    }

    Err(Error::Registration(format!(
        "Active configuration {} not found",
        active
    )))
}

fn get_descriptor(
    handle: &DeviceHandle<Context>,
    descriptor_type: u8,
    index: u8,
    buffer: &mut [u8],
) -> Result<usize> {
    handle
        .read_control(
            REQ_TYPE_DEVICE_IN,
            REQ_GET_DESCRIPTOR,
            u16::from(descriptor_type) << 8 | u16::from(index),
            0,
            buffer,
            DEFAULT_TIMEOUT,
        )
        .map_err(|e| Error::Transfer(map_rusb_error(e)))
}

fn release(handle: &mut DeviceHandle<Context>, claimed: &[u8]) {
    for interface in claimed {
        if let Err(e) = handle.release_interface(*interface) {
            warn!("Failed to release interface {}: {}", interface, e);
        }
        let _ = handle.attach_kernel_driver(*interface);
    }
}

fn registration(e: rusb::Error) -> Error {
    Error::Registration(e.to_string())
}

/// Isochronous endpoints in any alt-setting; [`RusbPort`](super::RusbPort) cannot relay them
pub fn isochronous_endpoints(identity: &DeviceIdentity) -> Vec<EndpointId> {
    let mut found = Vec::new();
    for endpoint in identity.interfaces.iter().flat_map(|s| &s.endpoints) {
        let id = endpoint.id();
        if id.kind == EndpointType::Isochronous && !found.contains(&id) {
            found.push(id);
        }
    }
    found
}

/// Map rusb device speed to protocol DeviceSpeed
pub fn map_device_speed(speed: rusb::Speed) -> DeviceSpeed {
    match speed {
        rusb::Speed::Low => DeviceSpeed::Low,
        rusb::Speed::Full => DeviceSpeed::Full,
        rusb::Speed::High => DeviceSpeed::High,
        rusb::Speed::Super => DeviceSpeed::Super,
        rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
        _ => DeviceSpeed::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::test_utils::{bulk_in, identity_with, interface_setting};
    use protocol::{Direction, EndpointDescriptor};

    #[test]
    fn test_map_device_speed() {
        assert_eq!(map_device_speed(rusb::Speed::Low), DeviceSpeed::Low);
        assert_eq!(map_device_speed(rusb::Speed::Full), DeviceSpeed::Full);
        assert_eq!(map_device_speed(rusb::Speed::High), DeviceSpeed::High);
        assert_eq!(map_device_speed(rusb::Speed::Super), DeviceSpeed::Super);
        assert_eq!(
            map_device_speed(rusb::Speed::SuperPlus),
            DeviceSpeed::SuperPlus
        );
        assert_eq!(map_device_speed(rusb::Speed::Unknown), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_summary_display() {
        let summary = DeviceSummary {
            bus_number: 1,
            device_address: 4,
            vendor_id: 0x1234,
            product_id: 0x5678,
            class: 0,
            speed: DeviceSpeed::High,
            product: Some("Widget".to_string()),
        };
        assert_eq!(
            summary.to_string(),
            "Bus 001 Device 004: ID 1234:5678 High Widget"
        );
    }

    #[test]
    fn test_isochronous_endpoints() {
        let iso_in = EndpointId::new(3, EndpointType::Isochronous, Direction::In);
        let identity = identity_with(vec![
            interface_setting(0, 0, vec![bulk_in()]),
            interface_setting(1, 0, Vec::new()),
            interface_setting(1, 1, vec![EndpointDescriptor::new(iso_in, 192, 1)]),
            interface_setting(1, 2, vec![EndpointDescriptor::new(iso_in, 384, 1)]),
        ]);
        assert_eq!(isochronous_endpoints(&identity), vec![iso_in]);

        let bulk_only = identity_with(vec![interface_setting(0, 0, vec![bulk_in()])]);
        assert!(isochronous_endpoints(&bulk_only).is_empty());
    }
}
