//! Message encoding and decoding
//!
//! Every message is a fixed header followed by kind-specific fields and the raw payload.
//! All integers are little-endian.
//!
//! # Wire Format
//!
//! ```text
//! Header:      [total_size: u64][kind: u8]
//! Data:        header + [number: u16][type: u8][dir: u8] + payload
//! Ack:         header + [number: u16][type: u8][dir: u8][status: i32] + payload
//! Management:  header + [subtype: u8] + payload
//! ```
//!
//! `total_size` counts the whole message including the header. A datagram may be
//! longer than `total_size`; trailing bytes are ignored.

use crate::error::{ProtocolError, Result};
use crate::messages::{ManagementKind, Message, MessageKind};
use crate::types::{Direction, EndpointId, EndpointType};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Write};

/// Size of the common header (total size + kind)
pub const HEADER_SIZE: usize = 9;

/// Size of an encoded endpoint identity
pub const ENDPOINT_ID_SIZE: usize = 4;

/// Size of the Ack status field
pub const STATUS_SIZE: usize = 4;

/// Size of the Management subtype field
pub const MANAGEMENT_SIZE: usize = 1;

/// Largest message that fits in a single UDP datagram
pub const MAX_MESSAGE_SIZE: usize = 65_507;

/// Number of bytes preceding the payload for a message kind
pub fn fixed_size(kind: MessageKind) -> usize {
    match kind {
        MessageKind::Data => HEADER_SIZE + ENDPOINT_ID_SIZE,
        MessageKind::Ack => HEADER_SIZE + ENDPOINT_ID_SIZE + STATUS_SIZE,
        MessageKind::Management => HEADER_SIZE + MANAGEMENT_SIZE,
    }
}

/// Total encoded size of a message
pub fn encoded_len(message: &Message) -> usize {
    fixed_size(message.kind()) + message.payload().len()
}

/// Encode a message to bytes
///
/// # Example
/// ```
/// use protocol::{Direction, EndpointId, EndpointType, Message, encode_message};
///
/// let ep = EndpointId::new(1, EndpointType::Bulk, Direction::In);
/// let bytes = encode_message(&Message::data(ep, vec![0xaa, 0xbb])).unwrap();
/// assert_eq!(bytes.len(), 15);
/// ```
pub fn encode_message(message: &Message) -> Result<Vec<u8>> {
    let size = encoded_len(message);
    if size > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut buf = Vec::with_capacity(size);
    buf.write_u64::<LittleEndian>(size as u64)?;
    buf.write_u8(message.kind().to_wire())?;

    match message {
        Message::Data { endpoint, payload } => {
            write_endpoint(&mut buf, endpoint)?;
            buf.write_all(payload)?;
        }
        Message::Ack {
            endpoint,
            status,
            payload,
        } => {
            write_endpoint(&mut buf, endpoint)?;
            buf.write_i32::<LittleEndian>(*status)?;
            buf.write_all(payload)?;
        }
        Message::Management { kind, payload } => {
            buf.write_u8(kind.to_wire())?;
            buf.write_all(payload)?;
        }
    }

    Ok(buf)
}

/// Decode and validate a message
///
/// Checks run in a fixed order: header size for the declared kind, Management subtype,
/// endpoint type and direction, then room for the Ack status. The first failure wins.
///
/// # Example
/// ```
/// use protocol::{Message, decode_message, encode_message};
///
/// let bytes = encode_message(&Message::reset()).unwrap();
/// assert_eq!(decode_message(&bytes).unwrap(), Message::reset());
/// assert!(decode_message(&bytes[..4]).is_err());
/// ```
pub fn decode_message(bytes: &[u8]) -> Result<Message> {
    if bytes.len() < HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    }

    let mut cursor = Cursor::new(bytes);
    let declared = cursor.read_u64::<LittleEndian>()?;
    let raw_kind = cursor.read_u8()?;

    // A declared size beyond the datagram means we lost the tail
    let total = usize::try_from(declared).unwrap_or(usize::MAX);
    if total > bytes.len() {
        return Err(ProtocolError::Truncated {
            needed: total,
            available: bytes.len(),
        });
    }
    let body = &bytes[..total];

    let kind = MessageKind::from_wire(raw_kind).ok_or(ProtocolError::InvalidKind(raw_kind))?;
    match kind {
        MessageKind::Management => {
            require(total, HEADER_SIZE + MANAGEMENT_SIZE)?;
            let raw = body[HEADER_SIZE];
            let kind =
                ManagementKind::from_wire(raw).ok_or(ProtocolError::InvalidManagementKind(raw))?;
            let payload = body[HEADER_SIZE + MANAGEMENT_SIZE..].to_vec();
            Ok(Message::Management { kind, payload })
        }
        MessageKind::Data | MessageKind::Ack => {
            require(total, HEADER_SIZE + ENDPOINT_ID_SIZE)?;
            let mut cursor = Cursor::new(&body[HEADER_SIZE..]);
            let endpoint = read_endpoint(&mut cursor)?;

            if kind == MessageKind::Data {
                let payload = body[HEADER_SIZE + ENDPOINT_ID_SIZE..].to_vec();
                return Ok(Message::Data { endpoint, payload });
            }

            require(total, fixed_size(MessageKind::Ack))?;
            let status = cursor.read_i32::<LittleEndian>()?;
            let payload = body[fixed_size(MessageKind::Ack)..].to_vec();
            Ok(Message::Ack {
                endpoint,
                status,
                payload,
            })
        }
    }
}

fn require(total: usize, needed: usize) -> Result<()> {
    if total < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: total,
        });
    }
    Ok(())
}

fn write_endpoint(buf: &mut Vec<u8>, endpoint: &EndpointId) -> Result<()> {
    buf.write_u16::<LittleEndian>(endpoint.number)?;
    buf.write_u8(endpoint.kind.to_wire())?;
    buf.write_u8(endpoint.direction.to_wire())?;
    Ok(())
}

fn read_endpoint(cursor: &mut Cursor<&[u8]>) -> Result<EndpointId> {
    let number = cursor.read_u16::<LittleEndian>()?;
    let raw_type = cursor.read_u8()?;
    let raw_dir = cursor.read_u8()?;

    let kind = EndpointType::from_wire(raw_type).ok_or(ProtocolError::InvalidEndpointType(raw_type))?;
    let direction = Direction::from_wire(raw_dir).ok_or(ProtocolError::InvalidDirection(raw_dir))?;

    Ok(EndpointId::new(number, kind, direction))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_in() -> EndpointId {
        EndpointId::new(1, EndpointType::Bulk, Direction::In)
    }

    #[test]
    fn test_data_layout() {
        let bytes = encode_message(&Message::data(bulk_in(), vec![0xaa, 0xbb])).unwrap();
        assert_eq!(
            bytes,
            vec![15, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 2, 0, 0xaa, 0xbb]
        );
    }

    #[test]
    fn test_ack_layout() {
        let ep = EndpointId::control(Direction::Out);
        let bytes = encode_message(&Message::ack(ep, -32, Vec::new())).unwrap();
        assert_eq!(bytes.len(), 17);
        assert_eq!(bytes[8], 1);
        assert_eq!(&bytes[13..17], &(-32i32).to_le_bytes());
    }

    #[test]
    fn test_management_layout() {
        let msg = Message::management(ManagementKind::NewDevice, vec![1, 2, 3]);
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(bytes.len(), 13);
        assert_eq!(bytes[8], 2);
        assert_eq!(bytes[9], 1);
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_reject_short_header() {
        let err = decode_message(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 9, .. }));
    }

    #[test]
    fn test_reject_unknown_kind() {
        let mut bytes = encode_message(&Message::reset()).unwrap();
        bytes[8] = 7;
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::InvalidKind(7))
        ));
    }

    #[test]
    fn test_reject_bad_management_subtype() {
        let mut bytes = encode_message(&Message::reset()).unwrap();
        bytes[9] = 3;
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::InvalidManagementKind(3))
        ));
    }

    #[test]
    fn test_reject_bad_endpoint_type() {
        let mut bytes = encode_message(&Message::data(bulk_in(), vec![])).unwrap();
        bytes[11] = 4;
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::InvalidEndpointType(4))
        ));
    }

    #[test]
    fn test_reject_bad_direction() {
        let mut bytes = encode_message(&Message::data(bulk_in(), vec![])).unwrap();
        bytes[12] = 2;
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::InvalidDirection(2))
        ));
    }

    #[test]
    fn test_reject_ack_without_status() {
        // A Data message relabelled as Ack has the identity but no status
        let mut bytes = encode_message(&Message::data(bulk_in(), vec![])).unwrap();
        bytes[8] = 1;
        assert!(matches!(
            decode_message(&bytes),
            Err(ProtocolError::Truncated { needed: 17, available: 13 })
        ));
    }

    #[test]
    fn test_reject_declared_size_beyond_datagram() {
        let bytes = encode_message(&Message::data(bulk_in(), vec![1, 2, 3, 4])).unwrap();
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_trailing_bytes_ignored() {
        let msg = Message::data(bulk_in(), vec![9]);
        let mut bytes = encode_message(&msg).unwrap();
        bytes.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_message_too_large() {
        let msg = Message::data(bulk_in(), vec![0; MAX_MESSAGE_SIZE]);
        assert!(matches!(
            encode_message(&msg),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }
}
