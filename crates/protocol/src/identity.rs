//! Device topology snapshot
//!
//! A [`DeviceIdentity`] is captured by the physical side when a device attaches and
//! carried to the virtual side in a Management/NewDevice payload:
//!
//! ```text
//! [speed: u32][device descriptor][configuration header]
//! [interface descriptor][endpoint descriptor]... (one group per alt-setting)
//! ```
//!
//! Parsing is lenient past the configuration header: unknown class-specific
//! descriptors are skipped, malformed entries are dropped with a warning and the
//! interface/endpoint counts are capped. Only the speed, device descriptor and
//! configuration header are mandatory.

use crate::descriptor::{
    ConfigDescriptor, DT_ENDPOINT, DT_INTERFACE, DeviceDescriptor, EndpointDescriptor,
    InterfaceDescriptor,
};
use crate::error::{ProtocolError, Result};
use crate::types::DeviceSpeed;
use byteorder::{LittleEndian, WriteBytesExt};
use tracing::warn;

/// Maximum number of interface alt-settings kept from a topology
pub const MAX_INTERFACES: usize = 64;

/// Maximum number of endpoints kept per alt-setting
pub const MAX_ENDPOINTS_PER_INTERFACE: usize = 8;

/// One alt-setting of one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceSetting {
    pub descriptor: InterfaceDescriptor,
    pub endpoints: Vec<EndpointDescriptor>,
    /// Whether this alt-setting's endpoints currently exist in the registry
    pub active: bool,
}

impl InterfaceSetting {
    pub fn new(descriptor: InterfaceDescriptor) -> Self {
        Self {
            descriptor,
            endpoints: Vec::new(),
            active: false,
        }
    }

    pub fn number(&self) -> u8 {
        self.descriptor.interface_number
    }

    pub fn alternate(&self) -> u8 {
        self.descriptor.alternate_setting
    }
}

/// Full device topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub speed: DeviceSpeed,
    pub device: DeviceDescriptor,
    pub config: ConfigDescriptor,
    pub interfaces: Vec<InterfaceSetting>,
}

impl DeviceIdentity {
    /// Build from raw descriptors as read from a device
    ///
    /// `config` is the full configuration block returned by GET_DESCRIPTOR, header included.
    pub fn from_raw(speed: DeviceSpeed, device: &[u8], config: &[u8]) -> Result<Self> {
        let mut payload = Vec::with_capacity(4 + device.len() + config.len());
        payload.write_u32::<LittleEndian>(speed.to_wire())?;
        payload.extend_from_slice(device);
        payload.extend_from_slice(config);
        Self::from_payload(&payload)
    }

    /// Serialize into a NewDevice payload
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(self.speed.to_wire())?;
        self.device.write_to(&mut buf)?;
        self.config.write_to(&mut buf)?;
        for setting in &self.interfaces {
            setting.descriptor.write_to(&mut buf)?;
            for endpoint in &setting.endpoints {
                endpoint.write_to(&mut buf)?;
            }
        }
        Ok(buf)
    }

    /// Parse a NewDevice payload
    pub fn from_payload(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(ProtocolError::Truncated {
                needed: 4,
                available: bytes.len(),
            });
        }
        let speed = DeviceSpeed::from_wire(u32::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3],
        ]));
        let mut rest = &bytes[4..];

        let device = DeviceDescriptor::parse(rest)?;
        rest = skip_descriptor(rest)?;
        let config = ConfigDescriptor::parse(rest)?;
        rest = skip_descriptor(rest)?;

        let mut interfaces: Vec<InterfaceSetting> = Vec::new();
        let mut current: Option<InterfaceSetting> = None;

        while rest.len() >= 2 {
            let length = usize::from(rest[0]);
            let descriptor_type = rest[1];
            if length < 2 || length > rest.len() {
                warn!(
                    "Malformed descriptor header (bLength {}, {} bytes left), ignoring the rest",
                    length,
                    rest.len()
                );
                break;
            }
            let raw = &rest[..length];
            rest = &rest[length..];

            match descriptor_type {
                DT_INTERFACE => {
                    push_setting(&mut interfaces, current.take());
                    match InterfaceDescriptor::parse(raw) {
                        Ok(descriptor) => current = Some(InterfaceSetting::new(descriptor)),
                        Err(e) => warn!("Skipping interface descriptor: {}", e),
                    }
                }
                DT_ENDPOINT => {
                    let Some(setting) = current.as_mut() else {
                        warn!("Endpoint descriptor outside of any interface, skipping");
                        continue;
                    };
                    if setting.endpoints.len() >= MAX_ENDPOINTS_PER_INTERFACE {
                        warn!(
                            "Interface {} alt {} has more than {} endpoints, truncating",
                            setting.number(),
                            setting.alternate(),
                            MAX_ENDPOINTS_PER_INTERFACE
                        );
                        continue;
                    }
                    match EndpointDescriptor::parse(raw) {
                        Ok(endpoint) => setting.endpoints.push(endpoint),
                        Err(e) => warn!("Skipping endpoint descriptor: {}", e),
                    }
                }
                // Class-specific and other descriptors carry nothing we replay
                _ => {}
            }
        }
        push_setting(&mut interfaces, current.take());

        Ok(Self {
            speed,
            device,
            config,
            interfaces,
        })
    }

    /// Find an alt-setting
    pub fn setting(&self, interface: u8, alternate: u8) -> Option<&InterfaceSetting> {
        self.interfaces
            .iter()
            .find(|s| s.number() == interface && s.alternate() == alternate)
    }

    pub fn setting_mut(&mut self, interface: u8, alternate: u8) -> Option<&mut InterfaceSetting> {
        self.interfaces
            .iter_mut()
            .find(|s| s.number() == interface && s.alternate() == alternate)
    }

    /// Currently active alt-settings as (interface, alternate) pairs
    pub fn active_settings(&self) -> Vec<(u8, u8)> {
        self.interfaces
            .iter()
            .filter(|s| s.active)
            .map(|s| (s.number(), s.alternate()))
            .collect()
    }

    /// Alt-setting 0 of every interface
    pub fn default_settings(&self) -> Vec<(u8, u8)> {
        self.interfaces
            .iter()
            .filter(|s| s.alternate() == 0)
            .map(|s| (s.number(), s.alternate()))
            .collect()
    }
}

/// Advance past a descriptor that already passed its header check
fn skip_descriptor(bytes: &[u8]) -> Result<&[u8]> {
    let length = usize::from(bytes[0]);
    bytes.get(length..).ok_or(ProtocolError::Truncated {
        needed: length,
        available: bytes.len(),
    })
}

fn push_setting(interfaces: &mut Vec<InterfaceSetting>, setting: Option<InterfaceSetting>) {
    let Some(setting) = setting else {
        return;
    };
    if interfaces.len() >= MAX_INTERFACES {
        warn!(
            "More than {} interface settings, dropping interface {} alt {}",
            MAX_INTERFACES,
            setting.number(),
            setting.alternate()
        );
        return;
    }
    interfaces.push(setting);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Direction, EndpointId, EndpointType};

    fn device_bytes() -> Vec<u8> {
        vec![
            18, 0x01, 0x00, 0x02, 0, 0, 0, 64, 0x34, 0x12, 0x78, 0x56, 0x00, 0x01, 1, 2, 3, 1,
        ]
    }

    fn config_bytes(body: &[u8]) -> Vec<u8> {
        let total = (9 + body.len()) as u16;
        let mut bytes = vec![9, 0x02];
        bytes.extend_from_slice(&total.to_le_bytes());
        bytes.extend_from_slice(&[1, 1, 0, 0x80, 50]);
        bytes.extend_from_slice(body);
        bytes
    }

    fn interface(number: u8, alt: u8, endpoints: u8) -> Vec<u8> {
        vec![9, 0x04, number, alt, endpoints, 0xff, 0, 0, 0]
    }

    fn endpoint(address: u8, attributes: u8) -> Vec<u8> {
        vec![7, 0x05, address, attributes, 0x00, 0x02, 0]
    }

    #[test]
    fn test_parse_topology() {
        let mut body = interface(0, 0, 2);
        body.extend(endpoint(0x81, 0x02));
        body.extend(endpoint(0x02, 0x02));
        // Class-specific descriptor between interfaces is ignored
        body.extend([5, 0x24, 0, 0, 0]);
        body.extend(interface(0, 1, 1));
        body.extend(endpoint(0x83, 0x03));

        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::High, &device_bytes(), &config_bytes(&body))
                .unwrap();

        assert_eq!(identity.speed, DeviceSpeed::High);
        assert_eq!(identity.device.vendor_id, 0x1234);
        assert_eq!(identity.interfaces.len(), 2);
        assert_eq!(identity.interfaces[0].endpoints.len(), 2);
        assert_eq!(
            identity.interfaces[1].endpoints[0].id(),
            EndpointId::new(3, EndpointType::Interrupt, Direction::In)
        );
        assert_eq!(identity.default_settings(), vec![(0, 0)]);
        assert!(identity.active_settings().is_empty());
    }

    #[test]
    fn test_payload_round_trip() {
        let mut body = interface(0, 0, 1);
        body.extend(endpoint(0x81, 0x02));
        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::Full, &device_bytes(), &config_bytes(&body))
                .unwrap();

        let payload = identity.to_payload().unwrap();
        assert_eq!(DeviceIdentity::from_payload(&payload).unwrap(), identity);
    }

    #[test]
    fn test_missing_device_descriptor_is_fatal() {
        let payload = [3, 0, 0, 0, 9, 0x02];
        assert!(DeviceIdentity::from_payload(&payload).is_err());
        assert!(DeviceIdentity::from_payload(&[1, 0]).is_err());
    }

    #[test]
    fn test_short_interface_skipped() {
        let mut body = vec![5, 0x04, 0, 0, 1];
        body.extend(endpoint(0x81, 0x02));
        body.extend(interface(1, 0, 1));
        body.extend(endpoint(0x82, 0x02));

        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::High, &device_bytes(), &config_bytes(&body))
                .unwrap();

        // The orphaned endpoint is dropped along with its broken interface
        assert_eq!(identity.interfaces.len(), 1);
        assert_eq!(identity.interfaces[0].number(), 1);
    }

    #[test]
    fn test_bad_header_stops_walk() {
        let mut body = interface(0, 0, 1);
        body.extend(endpoint(0x81, 0x02));
        body.extend([40, 0x04, 1]);

        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::High, &device_bytes(), &config_bytes(&body))
                .unwrap();
        assert_eq!(identity.interfaces.len(), 1);
    }

    #[test]
    fn test_truncates_to_maxima() {
        let mut body = Vec::new();
        for number in 0..(MAX_INTERFACES as u8 + 6) {
            body.extend(interface(number, 0, 0));
        }
        body.extend(interface(200, 0, 10));
        for n in 1..=10u8 {
            body.extend(endpoint(0x80 | n, 0x02));
        }

        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::High, &device_bytes(), &config_bytes(&body))
                .unwrap();
        assert_eq!(identity.interfaces.len(), MAX_INTERFACES);
        assert!(identity.setting(200, 0).is_none());

        let mut body = interface(0, 0, 10);
        for n in 1..=10u8 {
            body.extend(endpoint(0x80 | n, 0x02));
        }
        let identity =
            DeviceIdentity::from_raw(DeviceSpeed::High, &device_bytes(), &config_bytes(&body))
                .unwrap();
        assert_eq!(
            identity.interfaces[0].endpoints.len(),
            MAX_ENDPOINTS_PER_INTERFACE
        );
    }
}
