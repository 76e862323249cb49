//! Core USB types shared by both proxy sides

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// USB transfer type
///
/// Wire values follow the low two bits of an endpoint descriptor's `bmAttributes`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EndpointType {
    /// Control transfer (setup + optional data stage)
    Control,
    /// Isochronous transfer (time-sensitive, no retry)
    Isochronous,
    /// Bulk transfer (large data, error-checked)
    Bulk,
    /// Interrupt transfer (small periodic data)
    Interrupt,
}

impl EndpointType {
    /// Decode a wire value
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Control),
            1 => Some(Self::Isochronous),
            2 => Some(Self::Bulk),
            3 => Some(Self::Interrupt),
            _ => None,
        }
    }

    /// Encode as a wire value
    pub fn to_wire(self) -> u8 {
        match self {
            Self::Control => 0,
            Self::Isochronous => 1,
            Self::Bulk => 2,
            Self::Interrupt => 3,
        }
    }

    /// Transfer type encoded in an endpoint descriptor's `bmAttributes`
    pub fn from_attributes(attributes: u8) -> Self {
        match attributes & 0x03 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Control => "control",
            Self::Isochronous => "isoc",
            Self::Bulk => "bulk",
            Self::Interrupt => "interrupt",
        };
        f.write_str(name)
    }
}

/// Transfer direction, In being device-to-host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::In),
            1 => Some(Self::Out),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::In => 0,
            Self::Out => 1,
        }
    }

    /// Direction bit of an endpoint address or `bmRequestType`
    pub fn from_bit7(value: u8) -> Self {
        if value & 0x80 != 0 { Self::In } else { Self::Out }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::In => Self::Out,
            Self::Out => Self::In,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::In => f.write_str("in"),
            Self::Out => f.write_str("out"),
        }
    }
}

/// Endpoint identity: the correlation key carried by every Data and Ack message
///
/// Unique within one adapter's registry. Endpoint 0 exists once per direction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EndpointId {
    pub number: u16,
    pub kind: EndpointType,
    pub direction: Direction,
}

impl EndpointId {
    pub const fn new(number: u16, kind: EndpointType, direction: Direction) -> Self {
        Self {
            number,
            kind,
            direction,
        }
    }

    /// The implicit control endpoint 0 for one direction
    pub const fn control(direction: Direction) -> Self {
        Self::new(0, EndpointType::Control, direction)
    }

    pub fn is_control(&self) -> bool {
        self.kind == EndpointType::Control
    }

    /// USB endpoint address (number plus direction bit)
    pub fn address(&self) -> u8 {
        let number = (self.number & 0x0f) as u8;
        match self.direction {
            Direction::In => number | 0x80,
            Direction::Out => number,
        }
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{} {} {}", self.number, self.kind, self.direction)
    }
}

/// USB device speed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceSpeed {
    #[default]
    Unknown,
    /// Low speed - 1.5 Mbps (USB 1.0)
    Low,
    /// Full speed - 12 Mbps (USB 1.1)
    Full,
    /// High speed - 480 Mbps (USB 2.0)
    High,
    /// Wireless USB 2.5
    Wireless,
    /// SuperSpeed - 5 Gbps (USB 3.0)
    Super,
    /// SuperSpeed+ - 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    pub fn from_wire(value: u32) -> Self {
        match value {
            1 => Self::Low,
            2 => Self::Full,
            3 => Self::High,
            4 => Self::Wireless,
            5 => Self::Super,
            6 => Self::SuperPlus,
            _ => Self::Unknown,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Self::Unknown => 0,
            Self::Low => 1,
            Self::Full => 2,
            Self::High => 3,
            Self::Wireless => 4,
            Self::Super => 5,
            Self::SuperPlus => 6,
        }
    }
}

/// USB transfer error
///
/// Carried across the wire as a negative errno-style status in Ack messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
    /// Endpoint stalled (EPIPE)
    #[error("endpoint stalled")]
    Stall,
    /// Transfer was canceled before it completed
    #[error("transfer canceled")]
    Canceled,
    /// Transfer timed out
    #[error("transfer timed out")]
    Timeout,
    /// Device was disconnected
    #[error("no such device")]
    NoDevice,
    /// Device returned more data than requested
    #[error("buffer overflow")]
    Overflow,
    /// Device or endpoint busy
    #[error("resource busy")]
    Busy,
    /// Invalid parameter
    #[error("invalid parameter")]
    InvalidParam,
    /// Transfer type or request not supported by the port
    #[error("operation not supported")]
    NotSupported,
    /// I/O error
    #[error("I/O error")]
    Io,
    /// Any other native status
    #[error("transfer failed with status {0}")]
    Other(i32),
}

/// Status code for a successful transfer
pub const STATUS_SUCCESS: i32 = 0;

impl TransferError {
    /// Negative errno-style status code
    pub fn code(self) -> i32 {
        match self {
            Self::Stall => -32,
            Self::Canceled => -104,
            Self::Timeout => -110,
            Self::NoDevice => -19,
            Self::Overflow => -75,
            Self::Busy => -16,
            Self::InvalidParam => -22,
            Self::NotSupported => -95,
            Self::Io => -5,
            Self::Other(code) => code,
        }
    }

    /// Decode a status code; `None` means success
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            STATUS_SUCCESS => None,
            -32 => Some(Self::Stall),
            -104 => Some(Self::Canceled),
            -110 => Some(Self::Timeout),
            -19 => Some(Self::NoDevice),
            -75 => Some(Self::Overflow),
            -16 => Some(Self::Busy),
            -22 => Some(Self::InvalidParam),
            -95 => Some(Self::NotSupported),
            -5 => Some(Self::Io),
            other => Some(Self::Other(other)),
        }
    }
}

/// Status code of a transfer result
pub fn status_code<T>(result: &Result<T, TransferError>) -> i32 {
    match result {
        Ok(_) => STATUS_SUCCESS,
        Err(e) => e.code(),
    }
}
