//! Running gadget side: a [`VirtualAdapter`] wired to its UDP transport
//!
//! Embedders set up logging, build their [`GadgetBackend`] and call
//! [`GadgetService::start`] with a loaded [`GadgetConfig`].

use crate::{GadgetBackend, GadgetConfig, VirtualAdapter};
use anyhow::{Context, Result};
use common::{Channel, UdpTransport, spawn_delivery};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub struct GadgetService {
    adapter: Arc<VirtualAdapter>,
    transport: Arc<UdpTransport>,
    receive_task: JoinHandle<()>,
    delivery: JoinHandle<()>,
}

impl GadgetService {
    /// Bind the transport and start handing peer messages to a new adapter
    pub async fn start<B: GadgetBackend + 'static>(
        config: &GadgetConfig,
        backend: Arc<B>,
    ) -> Result<Self> {
        config.validate().context("Invalid configuration")?;

        let (transport, inbound, receive_task) = UdpTransport::open(&config.transport)
            .await
            .context("Failed to open UDP transport")?;
        let adapter = VirtualAdapter::new(backend, Channel::new("virtual", transport.clone()));

        let handler = adapter.clone();
        let delivery = spawn_delivery("virtual", inbound, move |message| {
            if let Err(e) = handler.handle_message(message) {
                warn!("Failed to handle message: {}", e);
            }
        });

        info!(
            "Gadget side listening on {}",
            transport.local_addr().context("Transport has no local address")?
        );
        Ok(Self {
            adapter,
            transport,
            receive_task,
            delivery,
        })
    }

    pub fn adapter(&self) -> &Arc<VirtualAdapter> {
        &self.adapter
    }

    pub fn local_addr(&self) -> common::Result<SocketAddr> {
        self.transport.local_addr()
    }

    /// Withdraw the gadget and stop receiving
    pub fn shutdown(self) {
        self.receive_task.abort();
        self.delivery.abort();
        self.adapter.unregister();
        info!("Gadget side stopped");
    }
}
