//! Device-transfer primitives
//!
//! A [`UsbPort`] is the local USB leg of an adapter: the real device on the physical
//! side, the foreign host on the virtual side. Transfers are submitted without
//! blocking; each one carries a [`Completer`] that the port consumes exactly once to
//! report the outcome back to the owning endpoint's queue.

use crate::endpoint::EndpointEvent;
use async_channel::Sender;
use protocol::{EndpointId, SetupPacket, TransferError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Stable handle of one in-flight transfer
///
/// Handles are never reused within a process, so a completion that arrives after
/// its endpoint was destroyed and recreated cannot match a newer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestHandle(pub u64);

impl RequestHandle {
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Outcome of a transfer: bytes actually transferred, or the failure
pub type TransferResult = std::result::Result<usize, TransferError>;

/// Completion notification for one transfer
#[derive(Debug)]
pub struct Completion {
    pub handle: RequestHandle,
    pub result: TransferResult,
    /// Bytes received (In); empty for Out
    pub data: Vec<u8>,
}

impl Completion {
    pub fn actual_length(&self) -> usize {
        self.result.as_ref().copied().unwrap_or(0)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.result, Err(TransferError::Canceled))
    }
}

/// One-shot completion callback for a submitted transfer
///
/// Dropping a completer without calling [`Completer::complete`] reports the
/// transfer as canceled, so the owning endpoint always hears back.
pub struct Completer {
    handle: RequestHandle,
    events: Option<Sender<EndpointEvent>>,
}

impl Completer {
    pub(crate) fn new(handle: RequestHandle, events: Sender<EndpointEvent>) -> Self {
        Self {
            handle,
            events: Some(events),
        }
    }

    pub fn handle(&self) -> RequestHandle {
        self.handle
    }

    /// Report the outcome; safe to call from any thread
    pub fn complete(mut self, result: TransferResult, data: Vec<u8>) {
        self.finish(result, data);
    }

    fn finish(&mut self, result: TransferResult, data: Vec<u8>) {
        if let Some(events) = self.events.take() {
            // A closed queue means the endpoint is already gone
            let _ = events.try_send(EndpointEvent::Completed(Completion {
                handle: self.handle,
                result,
                data,
            }));
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        self.finish(Err(TransferError::Canceled), Vec::new());
    }
}

impl fmt::Debug for Completer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("handle", &self.handle)
            .field("pending", &self.events.is_some())
            .finish()
    }
}

/// A transfer handed to a port
#[derive(Debug)]
pub struct Transfer {
    pub endpoint: EndpointId,
    pub handle: RequestHandle,
    /// Setup packet for control transfers
    pub setup: Option<SetupPacket>,
    /// Out: bytes to write. In: zero-filled buffer of the requested length
    pub buffer: Vec<u8>,
    /// Polling interval from the endpoint descriptor
    pub interval: u8,
    /// Isochronous packets in this request, 0 for other types
    pub iso_packets: usize,
    pub completer: Completer,
}

impl Transfer {
    pub fn length(&self) -> usize {
        self.buffer.len()
    }

    pub fn complete(self, result: TransferResult, data: Vec<u8>) {
        self.completer.complete(result, data);
    }
}

/// Local USB leg of an adapter
///
/// No method may block waiting for a transfer to finish.
pub trait UsbPort: Send + Sync {
    /// Queue a transfer; its outcome arrives through the transfer's completer
    fn submit(&self, transfer: Transfer) -> Result<(), TransferError>;

    /// Ask for an in-flight transfer to be aborted
    ///
    /// Advisory: the transfer still completes, normally with `TransferError::Canceled`.
    fn cancel(&self, endpoint: EndpointId, handle: RequestHandle);

    /// Clear a halt condition on an endpoint
    fn clear_halt(&self, endpoint: EndpointId) -> Result<(), TransferError>;

    /// Halt an endpoint so the other party sees a stall
    fn set_halt(&self, endpoint: EndpointId) -> Result<(), TransferError>;

    /// Select an interface alt-setting on the device
    fn set_interface(&self, _interface: u8, _alternate: u8) -> Result<(), TransferError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_increase() {
        let a = RequestHandle::next();
        let b = RequestHandle::next();
        assert!(b > a);
    }

    #[test]
    fn test_completer_reports_once() {
        let (tx, rx) = async_channel::unbounded();
        let handle = RequestHandle::next();
        Completer::new(handle, tx).complete(Ok(2), vec![1, 2]);

        let Ok(EndpointEvent::Completed(completion)) = rx.try_recv() else {
            panic!("expected completion");
        };
        assert_eq!(completion.handle, handle);
        assert_eq!(completion.actual_length(), 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_completer_reports_cancel() {
        let (tx, rx) = async_channel::unbounded();
        drop(Completer::new(RequestHandle::next(), tx));

        let Ok(EndpointEvent::Completed(completion)) = rx.try_recv() else {
            panic!("expected completion");
        };
        assert!(completion.is_canceled());
        assert_eq!(completion.actual_length(), 0);
    }
}
