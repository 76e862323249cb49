//! Standard USB descriptors and setup packets
//!
//! Only the fields the proxy needs to rebuild a device topology are decoded.
//! Parsers accept descriptors longer than the standard size (audio endpoints carry
//! two extra bytes); re-encoding always writes the standard layout.

use crate::error::{ProtocolError, Result};
use crate::types::{Direction, EndpointId, EndpointType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Descriptor type codes
pub const DT_DEVICE: u8 = 0x01;
pub const DT_CONFIG: u8 = 0x02;
pub const DT_INTERFACE: u8 = 0x04;
pub const DT_ENDPOINT: u8 = 0x05;

/// Standard request codes
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
pub const REQ_SET_CONFIGURATION: u8 = 0x09;
pub const REQ_SET_INTERFACE: u8 = 0x0b;

/// `bmRequestType` type bits
pub const REQ_TYPE_MASK: u8 = 0x60;
pub const REQ_TYPE_STANDARD: u8 = 0x00;

/// Length of a configuration descriptor header
pub const CONFIG_DESCRIPTOR_SIZE: usize = 9;

/// USB device descriptor (18 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub usb_version: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_version: u16,
    pub manufacturer_index: u8,
    pub product_index: u8,
    pub serial_index: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub const SIZE: usize = 18;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, Self::SIZE, DT_DEVICE, "device")?;
        let mut r = Cursor::new(&bytes[2..Self::SIZE]);
        Ok(Self {
            usb_version: r.read_u16::<LittleEndian>()?,
            class: r.read_u8()?,
            subclass: r.read_u8()?,
            protocol: r.read_u8()?,
            max_packet_size0: r.read_u8()?,
            vendor_id: r.read_u16::<LittleEndian>()?,
            product_id: r.read_u16::<LittleEndian>()?,
            device_version: r.read_u16::<LittleEndian>()?,
            manufacturer_index: r.read_u8()?,
            product_index: r.read_u8()?,
            serial_index: r.read_u8()?,
            num_configurations: r.read_u8()?,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(Self::SIZE as u8)?;
        buf.write_u8(DT_DEVICE)?;
        buf.write_u16::<LittleEndian>(self.usb_version)?;
        buf.write_u8(self.class)?;
        buf.write_u8(self.subclass)?;
        buf.write_u8(self.protocol)?;
        buf.write_u8(self.max_packet_size0)?;
        buf.write_u16::<LittleEndian>(self.vendor_id)?;
        buf.write_u16::<LittleEndian>(self.product_id)?;
        buf.write_u16::<LittleEndian>(self.device_version)?;
        buf.write_u8(self.manufacturer_index)?;
        buf.write_u8(self.product_index)?;
        buf.write_u8(self.serial_index)?;
        buf.write_u8(self.num_configurations)?;
        Ok(())
    }
}

/// USB configuration descriptor header (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigDescriptor {
    /// Length of the full configuration block including all sub-descriptors
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_index: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigDescriptor {
    pub const SIZE: usize = CONFIG_DESCRIPTOR_SIZE;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, Self::SIZE, DT_CONFIG, "configuration")?;
        let mut r = Cursor::new(&bytes[2..Self::SIZE]);
        Ok(Self {
            total_length: r.read_u16::<LittleEndian>()?,
            num_interfaces: r.read_u8()?,
            configuration_value: r.read_u8()?,
            configuration_index: r.read_u8()?,
            attributes: r.read_u8()?,
            max_power: r.read_u8()?,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(Self::SIZE as u8)?;
        buf.write_u8(DT_CONFIG)?;
        buf.write_u16::<LittleEndian>(self.total_length)?;
        buf.write_u8(self.num_interfaces)?;
        buf.write_u8(self.configuration_value)?;
        buf.write_u8(self.configuration_index)?;
        buf.write_u8(self.attributes)?;
        buf.write_u8(self.max_power)?;
        Ok(())
    }
}

/// USB interface descriptor (9 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interface_index: u8,
}

impl InterfaceDescriptor {
    pub const SIZE: usize = 9;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, Self::SIZE, DT_INTERFACE, "interface")?;
        Ok(Self {
            interface_number: bytes[2],
            alternate_setting: bytes[3],
            num_endpoints: bytes[4],
            class: bytes[5],
            subclass: bytes[6],
            protocol: bytes[7],
            interface_index: bytes[8],
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(&[
            Self::SIZE as u8,
            DT_INTERFACE,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.class,
            self.subclass,
            self.protocol,
            self.interface_index,
        ]);
        Ok(())
    }
}

/// USB endpoint descriptor (7 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub const SIZE: usize = 7;

    pub fn new(id: EndpointId, max_packet_size: u16, interval: u8) -> Self {
        Self {
            address: id.address(),
            attributes: id.kind.to_wire(),
            max_packet_size,
            interval,
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        check_header(bytes, Self::SIZE, DT_ENDPOINT, "endpoint")?;
        let mut r = Cursor::new(&bytes[2..Self::SIZE]);
        Ok(Self {
            address: r.read_u8()?,
            attributes: r.read_u8()?,
            max_packet_size: r.read_u16::<LittleEndian>()?,
            interval: r.read_u8()?,
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.write_u8(Self::SIZE as u8)?;
        buf.write_u8(DT_ENDPOINT)?;
        buf.write_u8(self.address)?;
        buf.write_u8(self.attributes)?;
        buf.write_u16::<LittleEndian>(self.max_packet_size)?;
        buf.write_u8(self.interval)?;
        Ok(())
    }

    pub fn number(&self) -> u16 {
        u16::from(self.address & 0x0f)
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.address)
    }

    pub fn kind(&self) -> EndpointType {
        EndpointType::from_attributes(self.attributes)
    }

    pub fn id(&self) -> EndpointId {
        EndpointId::new(self.number(), self.kind(), self.direction())
    }

    /// Bytes per microframe for a high-bandwidth isochronous endpoint
    ///
    /// Bits 12:11 of `wMaxPacketSize` hold the number of additional transactions.
    pub fn max_iso_frame_size(&self) -> usize {
        let w = usize::from(self.max_packet_size);
        ((w >> 11) + 1) * (w & 0x7ff)
    }
}

/// Control transfer setup packet (8 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    /// Parse the setup packet at the start of a control payload
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::InvalidSetup(bytes.len()));
        }
        let mut r = Cursor::new(&bytes[..Self::SIZE]);
        Ok(Self {
            request_type: r.read_u8()?,
            request: r.read_u8()?,
            value: r.read_u16::<LittleEndian>()?,
            index: r.read_u16::<LittleEndian>()?,
            length: r.read_u16::<LittleEndian>()?,
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let value = self.value.to_le_bytes();
        let index = self.index.to_le_bytes();
        let length = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value[0],
            value[1],
            index[0],
            index[1],
            length[0],
            length[1],
        ]
    }

    pub fn direction(&self) -> Direction {
        Direction::from_bit7(self.request_type)
    }

    pub fn is_standard(&self) -> bool {
        self.request_type & REQ_TYPE_MASK == REQ_TYPE_STANDARD
    }

    /// Standard SET_INTERFACE; `index` is the interface, `value` the alt-setting
    pub fn is_set_interface(&self) -> bool {
        self.is_standard() && self.request == REQ_SET_INTERFACE
    }

    pub fn is_set_configuration(&self) -> bool {
        self.is_standard() && self.request == REQ_SET_CONFIGURATION
    }

    /// GET_DESCRIPTOR for the full configuration block rather than its 9-byte header
    pub fn is_full_config_descriptor_request(&self) -> bool {
        self.is_standard()
            && self.request == REQ_GET_DESCRIPTOR
            && (self.value >> 8) as u8 == DT_CONFIG
            && usize::from(self.length) > CONFIG_DESCRIPTOR_SIZE
    }
}

fn check_header(bytes: &[u8], size: usize, descriptor_type: u8, kind: &'static str) -> Result<()> {
    if bytes.len() < size {
        return Err(ProtocolError::InvalidDescriptor {
            kind,
            reason: format!("{} bytes available, {} required", bytes.len(), size),
        });
    }
    if usize::from(bytes[0]) < size {
        return Err(ProtocolError::InvalidDescriptor {
            kind,
            reason: format!("bLength {}", bytes[0]),
        });
    }
    if bytes[1] != descriptor_type {
        return Err(ProtocolError::InvalidDescriptor {
            kind,
            reason: format!("bDescriptorType {:#04x}", bytes[1]),
        });
    }
    Ok(())
}
