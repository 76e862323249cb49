//! Virtual adapter
//!
//! Replays the topology announced by the physical side as a gadget and relays
//! the foreign host's transfers. Data and Ack messages are only accepted while
//! a device is registered.

use crate::backend::{GadgetBackend, SetupHandler};
use common::{AdapterCore, Channel, Error, Result, Side, UsbPort};
use protocol::{DeviceIdentity, ManagementKind, Message, SetupPacket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

pub struct VirtualAdapter {
    core: Arc<AdapterCore>,
    backend: Arc<dyn GadgetBackend>,
    registered: AtomicBool,
    this: Weak<VirtualAdapter>,
}

impl VirtualAdapter {
    pub fn new<B: GadgetBackend + 'static>(backend: Arc<B>, channel: Channel) -> Arc<Self> {
        let port: Arc<dyn UsbPort> = backend.clone();
        Arc::new_cyclic(|this| Self {
            core: AdapterCore::new(Side::Virtual, port, channel),
            backend,
            registered: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn core(&self) -> &Arc<AdapterCore> {
        &self.core
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Handle one message from the physical side
    pub fn handle_message(&self, message: Message) -> Result<()> {
        match message {
            Message::Management { kind, payload } => self.handle_management(kind, &payload),
            message if !self.is_registered() => {
                debug!("Dropping {:?} while unregistered", message.kind());
                Err(Error::NotRegistered)
            }
            message => self.core.route(message),
        }
    }

    /// Hand a foreign-host setup request to endpoint 0
    pub fn handle_setup(&self, setup: SetupPacket) -> Result<()> {
        if !self.is_registered() {
            return Err(Error::NotRegistered);
        }
        self.core.post_setup(setup)
    }

    fn handle_management(&self, kind: ManagementKind, payload: &[u8]) -> Result<()> {
        match kind {
            ManagementKind::NewDevice => self.register(payload),
            ManagementKind::Reset => {
                info!("Physical side reset, withdrawing device");
                self.unregister();
                Ok(())
            }
            ManagementKind::Reload => {
                warn!("Ignoring Reload from the physical side");
                Ok(())
            }
        }
    }

    fn register(&self, payload: &[u8]) -> Result<()> {
        self.unregister();

        let identity = DeviceIdentity::from_payload(payload).map_err(|e| {
            warn!("Rejecting device announcement: {}", e);
            Error::from(e)
        })?;
        let (vendor_id, product_id) = (identity.device.vendor_id, identity.device.product_id);
        self.core.install_identity(identity.clone());
        self.core.create_control_endpoints()?;

        if let Err(e) = self.backend.register(&identity, self.setup_handler()) {
            self.core.teardown();
            self.core.take_identity();
            return Err(match e {
                Error::Registration(_) => e,
                other => Error::Registration(other.to_string()),
            });
        }
        self.registered.store(true, Ordering::Release);

        self.core.restore_default_interfaces()?;
        info!(
            "Registered device {:04x}:{:04x}, {} endpoints live",
            vendor_id,
            product_id,
            self.core.registry().len()
        );
        Ok(())
    }

    /// Withdraw the gadget and drop every endpoint; no-op while unregistered
    pub fn unregister(&self) {
        if !self.registered.swap(false, Ordering::AcqRel) {
            return;
        }
        self.backend.unregister();
        self.core.teardown();
        self.core.take_identity();
        debug!("Device withdrawn");
    }

    fn setup_handler(&self) -> SetupHandler {
        let this = self.this.clone();
        Arc::new(move |setup| {
            let Some(adapter) = this.upgrade() else {
                return;
            };
            if let Err(e) = adapter.handle_setup(setup) {
                warn!("Failed to handle setup request: {}", e);
            }
        })
    }
}

impl std::fmt::Debug for VirtualAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualAdapter")
            .field("core", &self.core)
            .field("registered", &self.is_registered())
            .finish()
    }
}
