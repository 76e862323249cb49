//! Adapter context shared by both proxy sides
//!
//! An [`AdapterCore`] ties together the local [`UsbPort`], the peer [`Channel`],
//! the endpoint registry and the installed device topology. The physical and
//! virtual adapters each own one and differ only in their [`Side`], which decides
//! the direction that is continuously drained toward the peer.

use crate::channel::Channel;
use crate::endpoint::{Endpoint, EndpointEvent, EndpointHandler, EndpointWork, lock};
use crate::port::UsbPort;
use crate::registry::EndpointRegistry;
use crate::transfer::{Behavior, TransferMachine};
use crate::{Error, Result};
use protocol::{
    DeviceIdentity, Direction, EndpointDescriptor, EndpointId, Message, SetupPacket,
};
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

/// Which end of the proxy an adapter runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// Attached to the real device
    Physical,
    /// Impersonating the device toward a foreign host
    Virtual,
}

impl Side {
    /// Direction whose transfers are primed locally and forwarded as they complete
    ///
    /// The device produces In data; the foreign host produces Out data.
    pub fn drain_direction(self) -> Direction {
        match self {
            Side::Physical => Direction::In,
            Side::Virtual => Direction::Out,
        }
    }

    pub fn drains(self, direction: Direction) -> bool {
        direction == self.drain_direction()
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Physical => write!(f, "physical"),
            Side::Virtual => write!(f, "virtual"),
        }
    }
}

/// State shared by every endpoint of one adapter
pub struct AdapterCore {
    side: Side,
    port: Arc<dyn UsbPort>,
    channel: Channel,
    registry: EndpointRegistry,
    identity: Mutex<Option<DeviceIdentity>>,
}

impl AdapterCore {
    /// Create the context; endpoint workers hold it weakly
    pub fn new(side: Side, port: Arc<dyn UsbPort>, channel: Channel) -> Arc<Self> {
        Arc::new_cyclic(|core: &Weak<AdapterCore>| {
            let handler: Weak<dyn EndpointHandler> = core.clone();
            Self {
                side,
                registry: EndpointRegistry::new(port.clone(), handler),
                port,
                channel,
                identity: Mutex::new(None),
            }
        })
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn port(&self) -> &dyn UsbPort {
        self.port.as_ref()
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    /// Snapshot of the installed topology
    pub fn identity(&self) -> Option<DeviceIdentity> {
        lock(&self.identity).clone()
    }

    pub fn install_identity(&self, identity: DeviceIdentity) {
        *lock(&self.identity) = Some(identity);
    }

    pub fn take_identity(&self) -> Option<DeviceIdentity> {
        lock(&self.identity).take()
    }

    /// Create the In and Out halves of endpoint 0
    pub fn create_control_endpoints(&self) -> Result<()> {
        for direction in [Direction::In, Direction::Out] {
            self.create_endpoint(EndpointId::control(direction), None)?;
        }
        Ok(())
    }

    /// Create an endpoint, tolerating one that already exists
    fn create_endpoint(
        &self,
        id: EndpointId,
        descriptor: Option<EndpointDescriptor>,
    ) -> Result<Option<Arc<Endpoint>>> {
        match self.registry.create(id, descriptor) {
            Ok(endpoint) => Ok(Some(endpoint)),
            Err(Error::EndpointExists(_)) => {
                warn!("Endpoint {} already exists, keeping it", id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Mark an alt-setting active, create its endpoints and prime the draining ones
    pub fn enable_interface(&self, interface: u8, alternate: u8) -> Result<()> {
        let descriptors = {
            let mut identity = lock(&self.identity);
            let setting = identity
                .as_mut()
                .ok_or(Error::NotRegistered)?
                .setting_mut(interface, alternate)
                .ok_or(Error::UnknownInterface {
                    interface,
                    alternate,
                })?;
            setting.active = true;
            setting.endpoints.clone()
        };

        for descriptor in descriptors {
            let id = descriptor.id();
            let Some(endpoint) = self.create_endpoint(id, Some(descriptor))? else {
                continue;
            };
            if self.side.drains(id.direction)
                && let Err(e) = endpoint.behavior().send_to_device(self, &endpoint, None)
            {
                warn!("Failed to prime {}: {}", id, e);
            }
        }

        debug!("Enabled interface {} alt-setting {}", interface, alternate);
        Ok(())
    }

    /// Mark an alt-setting inactive and destroy its endpoints
    pub fn disable_interface(&self, interface: u8, alternate: u8) -> Result<()> {
        let descriptors = {
            let mut identity = lock(&self.identity);
            let setting = identity
                .as_mut()
                .ok_or(Error::NotRegistered)?
                .setting_mut(interface, alternate)
                .ok_or(Error::UnknownInterface {
                    interface,
                    alternate,
                })?;
            setting.active = false;
            setting.endpoints.clone()
        };

        for descriptor in descriptors {
            if let Err(e) = self.registry.destroy(descriptor.id()) {
                debug!("Disabling interface {}: {}", interface, e);
            }
        }

        debug!("Disabled interface {} alt-setting {}", interface, alternate);
        Ok(())
    }

    /// Return to alt-setting 0 of every interface
    ///
    /// Does nothing while no topology is installed.
    pub fn restore_default_interfaces(&self) -> Result<()> {
        let (active, defaults) = {
            let identity = lock(&self.identity);
            let Some(identity) = identity.as_ref() else {
                return Ok(());
            };
            (identity.active_settings(), identity.default_settings())
        };

        for (interface, alternate) in active {
            self.disable_interface(interface, alternate)?;
        }
        for (interface, alternate) in defaults {
            self.enable_interface(interface, alternate)?;
        }
        Ok(())
    }

    /// Select an alt-setting: old endpoints are destroyed before the new ones exist
    pub fn switch_interface(&self, interface: u8, alternate: u8) -> Result<()> {
        let previous: Vec<(u8, u8)> = {
            let identity = lock(&self.identity);
            let identity = identity.as_ref().ok_or(Error::NotRegistered)?;
            if identity.setting(interface, alternate).is_none() {
                return Err(Error::UnknownInterface {
                    interface,
                    alternate,
                });
            }
            identity
                .active_settings()
                .into_iter()
                .filter(|(number, _)| *number == interface)
                .collect()
        };

        self.port.set_interface(interface, alternate)?;

        for (number, alt) in previous {
            self.disable_interface(number, alt)?;
        }
        self.enable_interface(interface, alternate)?;

        info!(
            "{} side switched interface {} to alt-setting {}",
            self.side, interface, alternate
        );
        Ok(())
    }

    /// Destroy every endpoint and clear the active flags
    pub fn teardown(&self) {
        self.registry.destroy_all();
        if let Some(identity) = lock(&self.identity).as_mut() {
            for setting in &mut identity.interfaces {
                setting.active = false;
            }
        }
    }

    /// Send a message to the peer
    pub fn send(&self, message: Message) -> Result<usize> {
        self.channel.send(message)
    }

    /// Post a peer Data or Ack message to its endpoint's queue
    pub fn route(&self, message: Message) -> Result<()> {
        let Some(id) = message.endpoint() else {
            return Err(Error::InvalidRequest(format!(
                "{:?} message has no endpoint",
                message.kind()
            )));
        };
        self.registry.find(id)?.post(EndpointEvent::Peer(message))
    }

    /// Post a foreign-host setup request to the control endpoint for its direction
    pub fn post_setup(&self, setup: SetupPacket) -> Result<()> {
        self.registry
            .find(EndpointId::control(setup.direction()))?
            .post(EndpointEvent::Setup(setup))
    }
}

impl EndpointHandler for AdapterCore {
    fn process(&self, endpoint: &Arc<Endpoint>, work: EndpointWork) {
        let behavior = endpoint.behavior();
        let result = match work {
            EndpointWork::Completed(request, completion) => {
                behavior.on_device_completion(self, endpoint, request, completion)
            }
            EndpointWork::Peer(message) => behavior.on_peer_message(self, endpoint, message),
            EndpointWork::Setup(setup) => match behavior {
                Behavior::Control(control) => control.on_host_setup(self, endpoint, setup),
                _ => Err(Error::InvalidRequest(format!(
                    "setup request on non-control {}",
                    endpoint.id()
                ))),
            },
        };

        if let Err(e) = result {
            warn!("{} side, {}: {}", self.side, endpoint.id(), e);
        }
    }
}

impl fmt::Debug for AdapterCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterCore")
            .field("side", &self.side)
            .field("channel", &self.channel)
            .field("endpoints", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_direction() {
        assert!(Side::Physical.drains(Direction::In));
        assert!(!Side::Physical.drains(Direction::Out));
        assert!(Side::Virtual.drains(Direction::Out));
        assert_eq!(Side::Virtual.to_string(), "virtual");
    }
}
