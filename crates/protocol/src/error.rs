//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
///
/// Every variant describes a message or descriptor that failed validation. Receivers
/// drop the offending datagram; nothing here is ever surfaced to the peer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Fewer bytes than the declared kind requires
    #[error("Truncated message: needed {needed} bytes, got {available}")]
    Truncated { needed: usize, available: usize },

    /// Header kind discriminant is not Data, Ack or Management
    #[error("Invalid message kind: {0}")]
    InvalidKind(u8),

    /// Management subtype is not Reset, NewDevice or Reload
    #[error("Invalid management subtype: {0}")]
    InvalidManagementKind(u8),

    /// Endpoint type outside the four USB transfer types
    #[error("Invalid endpoint type: {0}")]
    InvalidEndpointType(u8),

    /// Endpoint direction outside In/Out
    #[error("Invalid endpoint direction: {0}")]
    InvalidDirection(u8),

    /// Encoded message does not fit in one datagram
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Descriptor with an unexpected type or length
    #[error("Invalid {kind} descriptor: {reason}")]
    InvalidDescriptor { kind: &'static str, reason: String },

    /// Setup packet shorter than 8 bytes
    #[error("Invalid setup packet: {0} bytes")]
    InvalidSetup(usize),

    /// I/O error while reading or writing a buffer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::Truncated {
            needed: 17,
            available: 13,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Truncated"));
        assert!(msg.contains("17"));
        assert!(msg.contains("13"));
    }

    #[test]
    fn test_descriptor_error_display() {
        let err = ProtocolError::InvalidDescriptor {
            kind: "device",
            reason: "bLength 12".to_string(),
        };
        assert_eq!(format!("{}", err), "Invalid device descriptor: bLength 12");
    }
}
