//! Bulk and interrupt endpoints

use super::{
    TransferMachine, acknowledge, apply_peer_ack, data_payload, unexpected, zeroed,
};
use crate::adapter::{AdapterCore, Side};
use crate::endpoint::{Endpoint, EndpointState, TransferRequest};
use crate::port::{Completion, RequestHandle, Transfer};
use crate::{Error, Result};
use protocol::{EndpointType, Message, TransferError};
use tracing::{debug, trace, warn};

/// Draining request size for bulk endpoints on the device side
pub const BULK_DRAIN_SIZE: usize = 2048;

/// Continuous-drain / single-shot-fill machine shared by bulk and interrupt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamMachine;

impl StreamMachine {
    fn drain_size(core: &AdapterCore, endpoint: &Endpoint) -> Result<usize> {
        let id = endpoint.id();
        if core.side() == Side::Physical && id.kind == EndpointType::Bulk {
            return Ok(BULK_DRAIN_SIZE);
        }
        endpoint
            .descriptor()
            .map(|d| usize::from(d.max_packet_size & 0x7ff))
            .ok_or_else(|| Error::InvalidRequest(format!("{} has no descriptor", id)))
    }

    fn on_drained(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        completion: Completion,
    ) -> Result<()> {
        let id = endpoint.id();
        match completion.result {
            Ok(length) => {
                let mut data = completion.data;
                data.truncate(length);
                if let Err(e) = self.send_to_peer(core, endpoint, Message::data(id, data)) {
                    warn!("Dropped {} bytes from {}: {}", length, id, e);
                }
                self.send_to_device(core, endpoint, None)
            }
            Err(TransferError::Canceled) => {
                trace!("{} on {} canceled", completion.handle, id);
                Ok(())
            }
            Err(TransferError::Stall) => {
                debug!("{} stalled, clearing halt", id);
                endpoint.set_state(EndpointState::ClearingHalt);
                core.port().clear_halt(id)?;
                endpoint.set_state(EndpointState::Idle);
                self.send_to_device(core, endpoint, None)
            }
            Err(e) => {
                warn!("Stopped draining {}: {}", id, e);
                Err(Error::Transfer(e))
            }
        }
    }
}

impl TransferMachine for StreamMachine {
    fn build_request(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<(TransferRequest, Transfer)> {
        let id = endpoint.id();
        let buffer = match message {
            None if core.side().drains(id.direction) => zeroed(Self::drain_size(core, endpoint)?)?,
            Some(message) if !core.side().drains(id.direction) => data_payload(message)?,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "{} cannot take this request on the {} side",
                    id,
                    core.side()
                )));
            }
        };

        let handle = RequestHandle::next();
        let request = TransferRequest::new(handle, None, Vec::new(), buffer.len());
        let transfer = Transfer {
            endpoint: id,
            handle,
            setup: None,
            buffer,
            interval: endpoint.descriptor().map_or(0, |d| d.interval),
            iso_packets: 0,
            completer: endpoint.completer(handle),
        };
        Ok((request, transfer))
    }

    fn on_device_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        _request: TransferRequest,
        completion: Completion,
    ) -> Result<()> {
        if core.side().drains(endpoint.id().direction) {
            self.on_drained(core, endpoint, completion)
        } else {
            acknowledge(self, core, endpoint, &completion)
        }
    }

    fn on_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        match message {
            Message::Data { .. } if !core.side().drains(endpoint.id().direction) => {
                self.send_to_device(core, endpoint, Some(message))
            }
            Message::Ack { .. } => apply_peer_ack(core, endpoint, &message),
            _ => Err(unexpected(endpoint, &message)),
        }
    }
}
