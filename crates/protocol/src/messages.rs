//! Protocol message definitions
//!
//! A [`Message`] is the envelope exchanged between the physical and virtual sides.
//! Each variant holds only the fields its kind carries on the wire.

use crate::types::{EndpointId, STATUS_SUCCESS, TransferError};

/// Header kind discriminant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Ack,
    Management,
}

impl MessageKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Data),
            1 => Some(Self::Ack),
            2 => Some(Self::Management),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Ack => 1,
            Self::Management => 2,
        }
    }
}

/// Management subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagementKind {
    /// Device went away; tear everything down
    Reset,
    /// Device topology snapshot follows in the payload
    NewDevice,
    /// Ask the physical side to re-announce its device
    Reload,
}

impl ManagementKind {
    pub fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reset),
            1 => Some(Self::NewDevice),
            2 => Some(Self::Reload),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            Self::Reset => 0,
            Self::NewDevice => 1,
            Self::Reload => 2,
        }
    }
}

/// Message exchanged between the two proxy sides
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Setup and/or data content of one USB transfer
    Data {
        endpoint: EndpointId,
        payload: Vec<u8>,
    },
    /// Confirms an operation or reports its failure status
    Ack {
        endpoint: EndpointId,
        status: i32,
        payload: Vec<u8>,
    },
    /// Device lifecycle notification
    Management {
        kind: ManagementKind,
        payload: Vec<u8>,
    },
}

impl Message {
    pub fn data(endpoint: EndpointId, payload: Vec<u8>) -> Self {
        Self::Data { endpoint, payload }
    }

    pub fn ack(endpoint: EndpointId, status: i32, payload: Vec<u8>) -> Self {
        Self::Ack {
            endpoint,
            status,
            payload,
        }
    }

    /// Ack carrying the status of a finished transfer
    pub fn ack_result<T>(
        endpoint: EndpointId,
        result: &Result<T, TransferError>,
        payload: Vec<u8>,
    ) -> Self {
        Self::ack(endpoint, crate::types::status_code(result), payload)
    }

    pub fn management(kind: ManagementKind, payload: Vec<u8>) -> Self {
        Self::Management { kind, payload }
    }

    pub fn reset() -> Self {
        Self::management(ManagementKind::Reset, Vec::new())
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Data { .. } => MessageKind::Data,
            Self::Ack { .. } => MessageKind::Ack,
            Self::Management { .. } => MessageKind::Management,
        }
    }

    /// Target endpoint of a Data or Ack message
    pub fn endpoint(&self) -> Option<EndpointId> {
        match self {
            Self::Data { endpoint, .. } | Self::Ack { endpoint, .. } => Some(*endpoint),
            Self::Management { .. } => None,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Data { payload, .. }
            | Self::Ack { payload, .. }
            | Self::Management { payload, .. } => payload,
        }
    }

    pub fn into_payload(self) -> Vec<u8> {
        match self {
            Self::Data { payload, .. }
            | Self::Ack { payload, .. }
            | Self::Management { payload, .. } => payload,
        }
    }

    /// Ack status decoded as a transfer error, `None` for success or non-Ack messages
    pub fn failure(&self) -> Option<TransferError> {
        match self {
            Self::Ack { status, .. } if *status != STATUS_SUCCESS => {
                TransferError::from_code(*status)
            }
            _ => None,
        }
    }
}
