//! Physical adapter
//!
//! Owns the adapter context for the real device. Attaching announces the
//! device topology to the peer before any endpoint is primed, so the peer
//! never sees transfer data for a device it does not know.

use common::{AdapterCore, Channel, Error, Result, Side, UsbPort};
use protocol::{DeviceIdentity, ManagementKind, Message};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

pub struct PhysicalAdapter {
    core: Arc<AdapterCore>,
    attached: AtomicBool,
}

impl PhysicalAdapter {
    pub fn new(port: Arc<dyn UsbPort>, channel: Channel) -> Arc<Self> {
        Arc::new(Self {
            core: AdapterCore::new(Side::Physical, port, channel),
            attached: AtomicBool::new(false),
        })
    }

    pub fn core(&self) -> &Arc<AdapterCore> {
        &self.core
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Announce a device and start draining its In endpoints
    pub fn attach(&self, identity: DeviceIdentity) -> Result<()> {
        self.core.create_control_endpoints()?;

        let payload = identity.to_payload()?;
        let (vendor_id, product_id) = (identity.device.vendor_id, identity.device.product_id);
        self.core.install_identity(identity);
        if let Err(e) = self
            .core
            .send(Message::management(ManagementKind::NewDevice, payload))
        {
            self.core.teardown();
            return Err(e);
        }
        self.attached.store(true, Ordering::Release);

        self.core.restore_default_interfaces()?;
        info!(
            "Attached device {:04x}:{:04x}, {} endpoints live",
            vendor_id,
            product_id,
            self.core.registry().len()
        );
        Ok(())
    }

    /// Tell the peer the device is gone and drop every endpoint
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        if let Err(e) = self.core.send(Message::reset()) {
            warn!("Failed to send Reset to peer: {}", e);
        }
        self.core.teardown();
        info!("Detached device");
    }

    /// Handle one message from the virtual side
    pub fn handle_message(&self, message: Message) -> Result<()> {
        match message {
            Message::Management { kind, .. } => self.handle_management(kind),
            message if !self.is_attached() => {
                debug!("Dropping {:?} while detached", message.kind());
                Err(Error::NotRegistered)
            }
            message => self.core.route(message),
        }
    }

    fn handle_management(&self, kind: ManagementKind) -> Result<()> {
        match kind {
            ManagementKind::Reset => {
                info!("Peer reset, tearing down endpoints");
                self.attached.store(false, Ordering::Release);
                self.core.teardown();
                Ok(())
            }
            ManagementKind::Reload => {
                let Some(identity) = self.core.identity() else {
                    warn!("Reload requested with no device attached");
                    return Ok(());
                };
                info!("Peer requested reload, re-announcing device");
                self.attached.store(false, Ordering::Release);
                self.core.teardown();
                self.attach(identity)
            }
            ManagementKind::NewDevice => {
                warn!("Ignoring NewDevice from the virtual side");
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for PhysicalAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalAdapter")
            .field("core", &self.core)
            .field("attached", &self.is_attached())
            .finish()
    }
}
