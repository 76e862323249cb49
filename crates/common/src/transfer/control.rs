//! Control endpoint (endpoint 0)
//!
//! Every control payload on the wire starts with the 8-byte setup packet. Requests
//! the two sides must agree on (interface switches, configuration resets) are
//! applied locally before the transfer is answered.

use super::{TransferMachine, data_payload, unexpected, with_capacity, zeroed};
use crate::adapter::{AdapterCore, Side};
use crate::endpoint::{Endpoint, TransferRequest};
use crate::port::{Completion, RequestHandle, Transfer};
use crate::{Error, Result};
use protocol::{Direction, Message, MessageKind, STATUS_SUCCESS, SetupPacket, TransferError};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlMachine;

impl ControlMachine {
    /// Handle a setup request from the foreign host
    pub fn on_host_setup(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        setup: SetupPacket,
    ) -> Result<()> {
        let id = endpoint.id();
        let forward = Message::data(id, setup.to_bytes().to_vec());
        debug!(
            "Host setup on {}: type {:#04x} request {:#04x} value {:#06x} index {} length {}",
            id, setup.request_type, setup.request, setup.value, setup.index, setup.length
        );

        match setup.direction() {
            Direction::In => {
                if setup.is_full_config_descriptor_request() {
                    core.restore_default_interfaces()?;
                }
                self.send_to_peer(core, endpoint, forward)?;
            }
            Direction::Out if setup.length > 0 => {
                // The data stage is read from the host before anything is forwarded
                self.send_to_device(core, endpoint, Some(forward))?;
            }
            Direction::Out => {
                if setup.is_set_interface()
                    && let Err(e) = core.switch_interface(setup.index as u8, setup.value as u8)
                {
                    warn!("Rejecting SET_INTERFACE from host: {}", e);
                    core.port().set_halt(id)?;
                    return Err(e);
                }
                self.send_to_peer(core, endpoint, forward.clone())?;
                self.send_to_device(core, endpoint, Some(forward))?;
            }
        }
        Ok(())
    }

    fn physical_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        setup: SetupPacket,
        mut message: Vec<u8>,
        completion: Completion,
    ) -> Result<()> {
        let id = endpoint.id();
        let reply = match (id.direction, completion.result) {
            (Direction::In, Ok(length)) => {
                message.extend_from_slice(&completion.data[..length.min(completion.data.len())]);
                Message::data(id, message)
            }
            (Direction::Out, Ok(_)) => {
                if setup.is_set_configuration() {
                    core.restore_default_interfaces()?;
                }
                if setup.length > 0 {
                    trace!("{} data stage accepted", id);
                    return Ok(());
                }
                Message::ack(id, STATUS_SUCCESS, message)
            }
            (_, Err(e)) => {
                debug!("Control request {:#04x} on {} failed: {}", setup.request, id, e);
                Message::ack(id, e.code(), message)
            }
        };
        self.send_to_peer(core, endpoint, reply)?;
        Ok(())
    }

    fn virtual_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        setup: SetupPacket,
        mut message: Vec<u8>,
        completion: Completion,
    ) -> Result<()> {
        let id = endpoint.id();
        match (id.direction, completion.result) {
            (Direction::Out, Ok(length)) if setup.length > 0 => {
                message.extend_from_slice(&completion.data[..length.min(completion.data.len())]);
                self.send_to_peer(core, endpoint, Message::data(id, message))?;
            }
            (_, Ok(length)) => trace!("{} answered host ({} bytes)", id, length),
            (_, Err(e)) => {
                warn!("Control request {:#04x} on {} failed: {}", setup.request, id, e);
                return Err(Error::Transfer(e));
            }
        }
        Ok(())
    }

    fn physical_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        let id = endpoint.id();
        match message.kind() {
            MessageKind::Data => {
                let setup = SetupPacket::parse(message.payload())?;
                if !setup.is_set_interface() {
                    return self.send_to_device(core, endpoint, Some(message));
                }

                let interface = setup.index as u8;
                let alternate = setup.value as u8;
                let status = match core.switch_interface(interface, alternate) {
                    Ok(()) => STATUS_SUCCESS,
                    Err(e) => {
                        warn!("SET_INTERFACE {}/{} failed: {}", interface, alternate, e);
                        e.status_code()
                    }
                };
                let ack = Message::ack(id, status, setup.to_bytes().to_vec());
                self.send_to_peer(core, endpoint, ack)?;
                Ok(())
            }
            MessageKind::Ack => {
                debug!(
                    "Peer acknowledged control request on {} ({:?})",
                    id,
                    message.failure()
                );
                Ok(())
            }
            MessageKind::Management => Err(unexpected(endpoint, &message)),
        }
    }

    fn virtual_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        let id = endpoint.id();
        match message {
            Message::Data { .. } if id.direction == Direction::In => {
                self.send_to_device(core, endpoint, Some(message))
            }
            Message::Ack { status, .. } => {
                if status == STATUS_SUCCESS {
                    trace!("Peer completed control request on {}", id);
                    return Ok(());
                }
                debug!(
                    "Peer failed control request on {} ({:?}), stalling host",
                    id,
                    TransferError::from_code(status)
                );
                core.port().set_halt(id)?;
                Ok(())
            }
            _ => Err(unexpected(endpoint, &message)),
        }
    }
}

impl TransferMachine for ControlMachine {
    fn build_request(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<(TransferRequest, Transfer)> {
        let id = endpoint.id();
        let payload = match message {
            Some(message) => data_payload(message)?,
            None => {
                return Err(Error::InvalidRequest(format!(
                    "{} needs a setup packet",
                    id
                )));
            }
        };
        let setup = SetupPacket::parse(&payload)?;

        let (message, buffer) = if core.side().drains(id.direction) {
            let length = usize::from(setup.length);
            let mut message = with_capacity(length + SetupPacket::SIZE)?;
            message.extend_from_slice(&setup.to_bytes());
            (message, zeroed(length)?)
        } else {
            let mut message = with_capacity(payload.len())?;
            message.extend_from_slice(&setup.to_bytes());
            (message, payload[SetupPacket::SIZE..].to_vec())
        };

        let handle = RequestHandle::next();
        let request = TransferRequest::new(handle, Some(setup), message, buffer.len());
        let transfer = Transfer {
            endpoint: id,
            handle,
            setup: Some(setup),
            buffer,
            interval: 0,
            iso_packets: 0,
            completer: endpoint.completer(handle),
        };
        Ok((request, transfer))
    }

    fn on_device_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<()> {
        if completion.is_canceled() {
            trace!("{} on {} canceled", completion.handle, endpoint.id());
            return Ok(());
        }
        let Some(setup) = request.setup else {
            return Err(Error::InvalidRequest(format!(
                "{} completed without a setup packet",
                request.handle
            )));
        };

        match core.side() {
            Side::Physical => {
                self.physical_completion(core, endpoint, setup, request.message, completion)
            }
            Side::Virtual => {
                self.virtual_completion(core, endpoint, setup, request.message, completion)
            }
        }
    }

    fn on_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        match core.side() {
            Side::Physical => self.physical_peer_message(core, endpoint, message),
            Side::Virtual => self.virtual_peer_message(core, endpoint, message),
        }
    }
}
