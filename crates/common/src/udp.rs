//! UDP transport
//!
//! One socket per side. Without a configured peer the transport answers whoever
//! sent the most recent datagram.

use crate::channel::{DatagramInlet, DatagramSink, create_datagram_queue};
use crate::config::TransportConfig;
use crate::{Error, Result};
use async_channel::Receiver;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct UdpTransport {
    socket: UdpSocket,
    peer: RwLock<Option<SocketAddr>>,
    fixed_peer: bool,
}

impl UdpTransport {
    /// Bind the socket and start receiving
    ///
    /// Returns the transport (usable as a [`DatagramSink`]), the inbound queue and
    /// the receive task.
    pub async fn open(
        config: &TransportConfig,
    ) -> Result<(Arc<Self>, Receiver<Bytes>, JoinHandle<()>)> {
        config
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;

        let socket = UdpSocket::bind(config.bind).await?;
        info!("UDP transport bound to {}", socket.local_addr()?);

        let transport = Arc::new(Self {
            socket,
            peer: RwLock::new(config.peer),
            fixed_peer: config.peer.is_some(),
        });

        let (inlet, inbound) = create_datagram_queue();
        let task = tokio::spawn(Self::receive_loop(
            transport.clone(),
            inlet,
            config.max_datagram_size,
        ));
        Ok((transport, inbound, task))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Current send target
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn learn_peer(&self, from: SocketAddr) {
        if self.fixed_peer || self.peer() == Some(from) {
            return;
        }
        *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(from);
        info!("Peer is now {}", from);
    }

    async fn receive_loop(self: Arc<Self>, inlet: DatagramInlet, max_datagram_size: usize) {
        let mut buf = vec![0u8; max_datagram_size];
        loop {
            match self.socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    self.learn_peer(from);
                    if inlet.deliver(Bytes::copy_from_slice(&buf[..len])).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("UDP receive failed: {}", e),
            }
        }
        debug!("UDP receive loop stopped");
    }
}

impl DatagramSink for UdpTransport {
    fn send_datagram(&self, datagram: &[u8]) -> io::Result<usize> {
        let peer = self
            .peer()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no peer address"))?;
        self.socket.try_send_to(datagram, peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_MAX_DATAGRAM_SIZE;
    use protocol::{
        Direction, ENDPOINT_ID_SIZE, EndpointId, HEADER_SIZE, MAX_MESSAGE_SIZE, Message,
        decode_message, encode_message,
    };
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(peer: Option<SocketAddr>) -> TransportConfig {
        TransportConfig {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            peer,
            max_datagram_size: 2048,
        }
    }

    #[tokio::test]
    async fn test_learns_peer_from_first_datagram() {
        let (listener, inbound, _task) = UdpTransport::open(&loopback(None)).await.unwrap();
        assert!(listener.send_datagram(&[1]).is_err());

        let target = listener.local_addr().unwrap();
        let (sender, _rx, _task2) = UdpTransport::open(&loopback(Some(target))).await.unwrap();
        sender.send_datagram(&[1, 2, 3]).unwrap();

        let datagram = inbound.recv().await.unwrap();
        assert_eq!(&datagram[..], &[1, 2, 3]);
        assert_eq!(listener.peer(), Some(sender.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn test_default_receive_size_fits_largest_message() {
        let mut config = loopback(None);
        config.max_datagram_size = DEFAULT_MAX_DATAGRAM_SIZE;
        let (listener, inbound, _task) = UdpTransport::open(&config).await.unwrap();

        let target = listener.local_addr().unwrap();
        let (sender, _rx, _task2) = UdpTransport::open(&loopback(Some(target))).await.unwrap();
        let control_in = EndpointId::control(Direction::In);
        let message = Message::data(control_in, vec![0x5a; MAX_MESSAGE_SIZE - HEADER_SIZE - ENDPOINT_ID_SIZE]);
        let datagram = encode_message(&message).unwrap();
        assert_eq!(datagram.len(), MAX_MESSAGE_SIZE);
        sender.send_datagram(&datagram).unwrap();

        let received = inbound.recv().await.unwrap();
        assert_eq!(received.len(), MAX_MESSAGE_SIZE);
        assert_eq!(decode_message(&received).unwrap(), message);
    }
}
