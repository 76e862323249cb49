//! Isochronous endpoints
//!
//! Loss tolerant: a failed drain is simply resubmitted, nothing is forwarded and no
//! Ack is produced. Only device loss stops the drain.

use super::{
    TransferMachine, acknowledge, apply_peer_ack, data_payload, unexpected, zeroed,
};
use crate::adapter::AdapterCore;
use crate::endpoint::{Endpoint, TransferRequest};
use crate::port::{Completion, RequestHandle, Transfer};
use crate::{Error, Result};
use protocol::{Message, TransferError};
use tracing::{trace, warn};

/// Packets per draining request
pub const ISO_BURST_PACKETS: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IsochronousMachine;

impl TransferMachine for IsochronousMachine {
    fn build_request(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<(TransferRequest, Transfer)> {
        let id = endpoint.id();
        let descriptor = endpoint
            .descriptor()
            .ok_or_else(|| Error::InvalidRequest(format!("{} has no descriptor", id)))?;

        let buffer = match message {
            None if core.side().drains(id.direction) => {
                zeroed(descriptor.max_iso_frame_size() * ISO_BURST_PACKETS)?
            }
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
            interval: descriptor.interval,
            iso_packets: ISO_BURST_PACKETS,
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
        let id = endpoint.id();
        if !core.side().drains(id.direction) {
            return acknowledge(self, core, endpoint, &completion);
        }

        match completion.result {
            Ok(length) if length > 0 => {
                let mut data = completion.data;
                data.truncate(length);
                if let Err(e) = self.send_to_peer(core, endpoint, Message::data(id, data)) {
                    trace!("Dropped isochronous frame from {}: {}", id, e);
                }
            }
            Ok(_) => {}
            Err(TransferError::Canceled) => return Ok(()),
            Err(TransferError::NoDevice) => {
                warn!("Stopped draining {}: device gone", id);
                return Err(Error::Transfer(TransferError::NoDevice));
            }
            Err(e) => trace!("Lost isochronous frame on {}: {}", id, e),
        }

        self.send_to_device(core, endpoint, None)
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
