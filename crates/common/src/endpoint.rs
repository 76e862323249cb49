//! Endpoints and their serialized task queues
//!
//! Every endpoint owns one queue. Device completions, peer messages and host setup
//! requests for that endpoint are handled strictly in order by a single tokio task,
//! while different endpoints proceed concurrently.

use crate::port::{Completer, Completion, RequestHandle};
use crate::transfer::Behavior;
use crate::{Error, Result};
use async_channel::{Receiver, Sender, unbounded};
use protocol::{EndpointDescriptor, EndpointId, Message, SetupPacket};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, trace, warn};

/// Event posted to an endpoint's queue
#[derive(Debug)]
pub enum EndpointEvent {
    /// A transfer finished (or was canceled)
    Completed(Completion),
    /// Data or Ack from the peer
    Peer(Message),
    /// Setup request from the foreign host (virtual side, endpoint 0)
    Setup(SetupPacket),
    /// The endpoint was destroyed; drain outstanding completions and stop
    Shutdown,
}

/// Lifecycle state of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Idle,
    Submitted,
    ClearingHalt,
    Destroyed,
}

/// One in-flight transfer owned by an endpoint
#[derive(Debug)]
pub struct TransferRequest {
    pub handle: RequestHandle,
    pub setup: Option<SetupPacket>,
    /// Peer-bound message buffer; starts with the setup packet for control transfers
    pub message: Vec<u8>,
    /// Requested transfer length
    pub length: usize,
}

impl TransferRequest {
    pub fn new(
        handle: RequestHandle,
        setup: Option<SetupPacket>,
        message: Vec<u8>,
        length: usize,
    ) -> Self {
        Self {
            handle,
            setup,
            message,
            length,
        }
    }

    /// Allocated size of the message buffer
    pub fn capacity(&self) -> usize {
        self.message.capacity()
    }
}

/// Work handed to the adapter after the queue has done its bookkeeping
#[derive(Debug)]
pub enum EndpointWork {
    Completed(TransferRequest, Completion),
    Peer(Message),
    Setup(SetupPacket),
}

/// Receiver of endpoint work, implemented by the adapter context
pub trait EndpointHandler: Send + Sync {
    fn process(&self, endpoint: &Arc<Endpoint>, work: EndpointWork);
}

/// A live endpoint
#[derive(Debug)]
pub struct Endpoint {
    id: EndpointId,
    descriptor: Option<EndpointDescriptor>,
    behavior: Behavior,
    state: Mutex<EndpointState>,
    inflight: Mutex<BTreeMap<RequestHandle, TransferRequest>>,
    events: Sender<EndpointEvent>,
}

impl Endpoint {
    pub(crate) fn new(
        id: EndpointId,
        descriptor: Option<EndpointDescriptor>,
    ) -> (Arc<Self>, Receiver<EndpointEvent>) {
        let (events, rx) = unbounded();
        let endpoint = Arc::new(Self {
            id,
            descriptor,
            behavior: Behavior::for_type(id.kind),
            state: Mutex::new(EndpointState::Idle),
            inflight: Mutex::new(BTreeMap::new()),
            events,
        });
        (endpoint, rx)
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// Descriptor, absent for endpoint 0
    pub fn descriptor(&self) -> Option<&EndpointDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    pub fn state(&self) -> EndpointState {
        *lock(&self.state)
    }

    /// Update the state; a destroyed endpoint stays destroyed
    pub(crate) fn set_state(&self, state: EndpointState) {
        let mut current = lock(&self.state);
        if *current != EndpointState::Destroyed {
            *current = state;
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == EndpointState::Destroyed
    }

    pub(crate) fn mark_destroyed(&self) {
        *lock(&self.state) = EndpointState::Destroyed;
    }

    /// Number of transfers awaiting completion
    pub fn inflight_len(&self) -> usize {
        lock(&self.inflight).len()
    }

    pub fn inflight_handles(&self) -> Vec<RequestHandle> {
        lock(&self.inflight).keys().copied().collect()
    }

    pub(crate) fn track(&self, request: TransferRequest) {
        lock(&self.inflight).insert(request.handle, request);
    }

    pub(crate) fn untrack(&self, handle: RequestHandle) -> Option<TransferRequest> {
        lock(&self.inflight).remove(&handle)
    }

    /// Completion callback bound to this endpoint's queue
    pub fn completer(&self, handle: RequestHandle) -> Completer {
        Completer::new(handle, self.events.clone())
    }

    /// Queue an event for this endpoint
    pub fn post(&self, event: EndpointEvent) -> Result<()> {
        self.events
            .try_send(event)
            .map_err(|e| Error::Channel(format!("{} queue closed: {}", self.id, e)))
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drain an endpoint's queue until it is destroyed and has no transfers left
pub(crate) async fn run_endpoint(
    endpoint: Arc<Endpoint>,
    events: Receiver<EndpointEvent>,
    handler: Weak<dyn EndpointHandler>,
) {
    let id = endpoint.id();
    let mut closing = false;

    while let Ok(event) = events.recv().await {
        let work = match event {
            EndpointEvent::Shutdown => {
                closing = true;
                None
            }
            EndpointEvent::Completed(completion) => match endpoint.untrack(completion.handle) {
                None => {
                    trace!("Ignoring late completion {} on {}", completion.handle, id);
                    None
                }
                Some(request) if endpoint.is_destroyed() => {
                    debug!("Released {} on destroyed {}", request.handle, id);
                    None
                }
                Some(request) => {
                    if endpoint.inflight_len() == 0 {
                        endpoint.set_state(EndpointState::Idle);
                    }
                    Some(EndpointWork::Completed(request, completion))
                }
            },
            EndpointEvent::Peer(message) if endpoint.is_destroyed() => {
                warn!("Dropping {:?} message for destroyed {}", message.kind(), id);
                None
            }
            EndpointEvent::Peer(message) => Some(EndpointWork::Peer(message)),
            EndpointEvent::Setup(_) if endpoint.is_destroyed() => None,
            EndpointEvent::Setup(setup) => Some(EndpointWork::Setup(setup)),
        };

        if let Some(work) = work {
            let Some(handler) = handler.upgrade() else {
                break;
            };
            handler.process(&endpoint, work);
        }

        if closing && endpoint.inflight_len() == 0 {
            break;
        }
    }

    debug!("Endpoint {} worker stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{Direction, EndpointType};

    #[test]
    fn test_destroyed_state_is_terminal() {
        let (endpoint, _rx) = Endpoint::new(EndpointId::control(Direction::In), None);
        assert_eq!(endpoint.state(), EndpointState::Idle);

        endpoint.set_state(EndpointState::Submitted);
        endpoint.mark_destroyed();
        endpoint.set_state(EndpointState::Idle);
        assert_eq!(endpoint.state(), EndpointState::Destroyed);
    }

    #[test]
    fn test_inflight_ordered_by_submission() {
        let id = EndpointId::new(1, EndpointType::Bulk, Direction::In);
        let (endpoint, _rx) = Endpoint::new(id, None);

        let first = RequestHandle::next();
        let second = RequestHandle::next();
        endpoint.track(TransferRequest::new(second, None, Vec::new(), 8));
        endpoint.track(TransferRequest::new(first, None, Vec::new(), 8));

        assert_eq!(endpoint.inflight_handles(), vec![first, second]);
        assert!(endpoint.untrack(first).is_some());
        assert!(endpoint.untrack(first).is_none());
        assert_eq!(endpoint.inflight_len(), 1);
    }
}
