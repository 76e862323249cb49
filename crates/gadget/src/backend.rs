//! Gadget backend seam

use common::{Result, UsbPort};
use protocol::{DeviceIdentity, SetupPacket};
use std::sync::Arc;

/// Callback receiving each setup request the foreign host sends to endpoint 0
pub type SetupHandler = Arc<dyn Fn(SetupPacket) + Send + Sync>;

/// Device-side gadget function presented to a foreign host
///
/// As a [`UsbPort`] it carries the host's transfers: In submissions answer host
/// reads, Out submissions wait for host writes.
pub trait GadgetBackend: UsbPort {
    /// Present a device with this topology; setup requests go to `on_setup`
    fn register(&self, identity: &DeviceIdentity, on_setup: SetupHandler) -> Result<()>;

    /// Withdraw the device from the foreign host
    fn unregister(&self);
}
