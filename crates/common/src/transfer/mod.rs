//! Per-transfer-type state machines
//!
//! Each endpoint type gets one behavior set. The same machines run on both sides of
//! the proxy; what changes is which direction drains the local USB leg toward the
//! peer (see [`Side`](crate::adapter::Side)):
//!
//! - the *draining* leg is primed with empty requests and forwards what completes,
//! - the *filling* leg issues one transfer per peer Data message and acknowledges it.

mod control;
mod isochronous;
mod stream;

pub use control::ControlMachine;
pub use isochronous::{ISO_BURST_PACKETS, IsochronousMachine};
pub use stream::{BULK_DRAIN_SIZE, StreamMachine};

use crate::adapter::AdapterCore;
use crate::endpoint::{Endpoint, EndpointState, TransferRequest};
use crate::port::{Completion, Transfer};
use crate::{Error, Result};
use protocol::{EndpointType, Message, TransferError};
use tracing::{debug, trace, warn};

/// Operations every endpoint type implements
pub trait TransferMachine {
    /// Build a request; `message` is absent when priming a draining transfer
    fn build_request(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<(TransferRequest, Transfer)>;

    /// Build a request and submit it to the local port
    fn send_to_device(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<()> {
        let (request, transfer) = self.build_request(core, endpoint, message)?;
        submit(core, endpoint, request, transfer)
    }

    /// Interpret a finished transfer
    fn on_device_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<()>;

    /// Forward a message to the peer
    fn send_to_peer(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<usize> {
        trace!(
            "Sending {:?} for {} to peer ({} bytes)",
            message.kind(),
            endpoint.id(),
            message.payload().len()
        );
        core.channel().send(message)
    }

    /// Handle a Data or Ack message from the peer
    fn on_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()>;
}

/// Behavior set of an endpoint, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Control(ControlMachine),
    Bulk(StreamMachine),
    Interrupt(StreamMachine),
    Isochronous(IsochronousMachine),
}

impl Behavior {
    pub fn for_type(kind: EndpointType) -> Self {
        match kind {
            EndpointType::Control => Self::Control(ControlMachine),
            EndpointType::Bulk => Self::Bulk(StreamMachine),
            EndpointType::Interrupt => Self::Interrupt(StreamMachine),
            EndpointType::Isochronous => Self::Isochronous(IsochronousMachine),
        }
    }

    fn machine(&self) -> &dyn TransferMachine {
        match self {
            Self::Control(m) => m,
            Self::Bulk(m) | Self::Interrupt(m) => m,
            Self::Isochronous(m) => m,
        }
    }
}

impl TransferMachine for Behavior {
    fn build_request(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<(TransferRequest, Transfer)> {
        self.machine().build_request(core, endpoint, message)
    }

    fn send_to_device(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Option<Message>,
    ) -> Result<()> {
        self.machine().send_to_device(core, endpoint, message)
    }

    fn on_device_completion(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        request: TransferRequest,
        completion: Completion,
    ) -> Result<()> {
        self.machine()
            .on_device_completion(core, endpoint, request, completion)
    }

    fn send_to_peer(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<usize> {
        self.machine().send_to_peer(core, endpoint, message)
    }

    fn on_peer_message(
        &self,
        core: &AdapterCore,
        endpoint: &Endpoint,
        message: Message,
    ) -> Result<()> {
        self.machine().on_peer_message(core, endpoint, message)
    }
}

/// Track a request on its endpoint and hand the transfer to the port
fn submit(
    core: &AdapterCore,
    endpoint: &Endpoint,
    request: TransferRequest,
    transfer: Transfer,
) -> Result<()> {
    let id = endpoint.id();
    if endpoint.is_destroyed() {
        return Err(Error::EndpointDestroyed(id));
    }

    let handle = request.handle;
    let length = transfer.length();
    endpoint.track(request);

    if let Err(e) = core.port().submit(transfer) {
        endpoint.untrack(handle);
        return Err(Error::Transfer(e));
    }

    // Destruction marks the endpoint before it collects handles to cancel, so a
    // request tracked after that snapshot is canceled here instead
    if endpoint.is_destroyed() {
        core.port().cancel(id, handle);
        return Err(Error::EndpointDestroyed(id));
    }

    endpoint.set_state(EndpointState::Submitted);
    trace!("Submitted {} on {} ({} bytes)", handle, endpoint.id(), length);
    Ok(())
}

/// Zero-filled buffer, failing instead of aborting when memory is short
fn zeroed(length: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(length)
        .map_err(|_| Error::Allocation(length))?;
    buf.resize(length, 0);
    Ok(buf)
}

/// Empty buffer with room for `capacity` bytes
fn with_capacity(capacity: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(capacity)
        .map_err(|_| Error::Allocation(capacity))?;
    Ok(buf)
}

/// Payload of a peer Data message
fn data_payload(message: Message) -> Result<Vec<u8>> {
    match message {
        Message::Data { payload, .. } => Ok(payload),
        other => Err(Error::InvalidRequest(format!(
            "expected Data, got {:?}",
            other.kind()
        ))),
    }
}

/// Report a finished filling transfer to the peer as a status-only Ack
fn acknowledge<M: TransferMachine + ?Sized>(
    machine: &M,
    core: &AdapterCore,
    endpoint: &Endpoint,
    completion: &Completion,
) -> Result<()> {
    if completion.is_canceled() {
        return Ok(());
    }
    if let Err(e) = completion.result {
        debug!("{} on {} failed: {}", completion.handle, endpoint.id(), e);
    }
    let ack = Message::ack_result(endpoint.id(), &completion.result, Vec::new());
    machine.send_to_peer(core, endpoint, ack)?;
    Ok(())
}

/// Apply a peer Ack to a non-control endpoint
///
/// A stall reported for the draining leg halts the local endpoint so the stall is
/// visible on this side too.
fn apply_peer_ack(core: &AdapterCore, endpoint: &Endpoint, message: &Message) -> Result<()> {
    let id = endpoint.id();
    match message.failure() {
        None => {
            trace!("Peer acknowledged {}", id);
            Ok(())
        }
        Some(TransferError::Stall) if core.side().drains(id.direction) => {
            debug!("Peer reported stall on {}, halting", id);
            core.port().set_halt(id).map_err(Error::Transfer)
        }
        Some(e) => {
            warn!("Peer reported failure on {}: {}", id, e);
            Ok(())
        }
    }
}

fn unexpected(endpoint: &Endpoint, message: &Message) -> Error {
    Error::InvalidRequest(format!(
        "unexpected {:?} message for {}",
        message.kind(),
        endpoint.id()
    ))
}
