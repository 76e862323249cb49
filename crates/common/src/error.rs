//! Common error types

use protocol::{EndpointId, ProtocolError, TransferError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed message or descriptor
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Device or host rejected or aborted a transfer
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// Could not allocate a transfer buffer
    #[error("Failed to allocate {0} byte buffer")]
    Allocation(usize),

    #[error("Endpoint {0} already exists")]
    EndpointExists(EndpointId),

    /// Peer referenced an endpoint this side does not have
    #[error("No endpoint {0}")]
    EndpointNotFound(EndpointId),

    /// Endpoint was destroyed while a request was being submitted
    #[error("Endpoint {0} was destroyed")]
    EndpointDestroyed(EndpointId),

    #[error("Unknown interface {interface} alt-setting {alternate}")]
    UnknownInterface { interface: u8, alternate: u8 },

    /// No device topology is installed
    #[error("Adapter is not registered")]
    NotRegistered,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Attaching to the device or registering the gadget failed
    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Status code reported to the peer when this error ends a transfer
    pub fn status_code(&self) -> i32 {
        match self {
            Error::Transfer(e) => e.code(),
            Error::UnknownInterface { .. } | Error::InvalidRequest(_) | Error::Protocol(_) => {
                TransferError::InvalidParam.code()
            }
            Error::NotRegistered | Error::EndpointNotFound(_) | Error::EndpointDestroyed(_) => {
                TransferError::NoDevice.code()
            }
            _ => TransferError::Io.code(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code() {
        assert_eq!(Error::Transfer(TransferError::Stall).status_code(), -32);
        assert_eq!(
            Error::UnknownInterface {
                interface: 0,
                alternate: 3
            }
            .status_code(),
            -22
        );
        assert_eq!(Error::Allocation(64).status_code(), -5);
    }
}
