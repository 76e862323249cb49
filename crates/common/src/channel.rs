//! Datagram channel between the two proxy sides
//!
//! Outbound messages are encoded and handed to a [`DatagramSink`] without blocking.
//! Inbound datagrams land in a bounded queue and are decoded and delivered one at a
//! time, in arrival order, by a single tokio task.

use crate::{Error, Result};
use async_channel::{Receiver, Sender, TrySendError, bounded};
use bytes::Bytes;
use protocol::{Message, decode_message, encode_message};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Datagrams buffered before new arrivals are dropped
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Non-blocking datagram send primitive
pub trait DatagramSink: Send + Sync {
    /// Send one datagram, returning the number of bytes written
    ///
    /// Fails with `io::ErrorKind::NotConnected` when no peer is known.
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize>;
}

/// Outbound half of the channel
#[derive(Clone)]
pub struct Channel {
    name: Arc<str>,
    sink: Arc<dyn DatagramSink>,
}

impl Channel {
    pub fn new(name: &str, sink: Arc<dyn DatagramSink>) -> Self {
        Self {
            name: Arc::from(name),
            sink,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Encode and send one message; no retry on failure
    pub fn send(&self, message: Message) -> Result<usize> {
        let datagram = encode_message(&message)?;
        let sent = self.sink.send_datagram(&datagram)?;
        trace!(
            "{}: sent {:?} ({} bytes)",
            self.name,
            message.kind(),
            sent
        );
        Ok(sent)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

/// Producer end of the inbound queue, fed by the transport
#[derive(Debug, Clone)]
pub struct DatagramInlet {
    tx: Sender<Bytes>,
}

impl DatagramInlet {
    /// Queue a received datagram, dropping it when the queue is full
    pub fn deliver(&self, datagram: Bytes) -> Result<()> {
        match self.tx.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(datagram)) => {
                warn!(
                    "Inbound queue full, dropping {} byte datagram",
                    datagram.len()
                );
                Ok(())
            }
            Err(TrySendError::Closed(_)) => {
                Err(Error::Channel("inbound queue closed".to_string()))
            }
        }
    }
}

/// Create the inbound datagram queue
pub fn create_datagram_queue() -> (DatagramInlet, Receiver<Bytes>) {
    let (tx, rx) = bounded(INBOUND_QUEUE_CAPACITY);
    (DatagramInlet { tx }, rx)
}

/// Decode inbound datagrams and hand each valid message to `deliver`
///
/// Malformed datagrams are logged and discarded. The task ends when every inlet
/// has been dropped.
pub fn spawn_delivery<F>(name: &str, inbound: Receiver<Bytes>, deliver: F) -> JoinHandle<()>
where
    F: Fn(Message) + Send + 'static,
{
    let name = name.to_string();
    tokio::spawn(async move {
        while let Ok(datagram) = inbound.recv().await {
            match decode_message(&datagram) {
                Ok(message) => deliver(message),
                Err(e) => warn!(
                    "{}: discarding invalid datagram ({} bytes): {}",
                    name,
                    datagram.len(),
                    e
                ),
            }
        }
        debug!("{}: delivery stopped", name);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Disconnected;

    impl DatagramSink for Disconnected {
        fn send_datagram(&self, _datagram: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::NotConnected))
        }
    }

    #[test]
    fn test_send_without_peer() {
        let channel = Channel::new("test", Arc::new(Disconnected));
        let err = channel.send(Message::reset()).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::NotConnected));
    }

    #[test]
    fn test_full_queue_drops() {
        let (inlet, rx) = create_datagram_queue();
        for _ in 0..INBOUND_QUEUE_CAPACITY + 5 {
            inlet.deliver(Bytes::from_static(&[0])).unwrap();
        }
        assert_eq!(rx.len(), INBOUND_QUEUE_CAPACITY);

        drop(rx);
        assert!(inlet.deliver(Bytes::new()).is_err());
    }
}
