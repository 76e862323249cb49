//! Endpoint registry
//!
//! The registry is the only place endpoints are created or destroyed. Each adapter
//! keeps its own; identities are unique within one registry only.

use crate::endpoint::{Endpoint, EndpointEvent, EndpointHandler, run_endpoint};
use crate::port::UsbPort;
use crate::{Error, Result};
use protocol::{EndpointDescriptor, EndpointId};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::debug;

/// Live endpoints of one adapter, keyed by identity
pub struct EndpointRegistry {
    endpoints: RwLock<HashMap<EndpointId, Arc<Endpoint>>>,
    port: Arc<dyn UsbPort>,
    handler: Weak<dyn EndpointHandler>,
}

impl EndpointRegistry {
    pub fn new(port: Arc<dyn UsbPort>, handler: Weak<dyn EndpointHandler>) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            port,
            handler,
        }
    }

    /// Create an endpoint and start its queue
    ///
    /// The behavior is chosen from the identity's type. Must be called from within a
    /// tokio runtime.
    pub fn create(
        &self,
        id: EndpointId,
        descriptor: Option<EndpointDescriptor>,
    ) -> Result<Arc<Endpoint>> {
        let mut endpoints = self.endpoints.write().unwrap_or_else(PoisonError::into_inner);
        if endpoints.contains_key(&id) {
            return Err(Error::EndpointExists(id));
        }

        let (endpoint, events) = Endpoint::new(id, descriptor);
        tokio::spawn(run_endpoint(endpoint.clone(), events, self.handler.clone()));
        endpoints.insert(id, endpoint.clone());

        debug!("Created endpoint {}", id);
        Ok(endpoint)
    }

    pub fn find(&self, id: EndpointId) -> Result<Arc<Endpoint>> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or(Error::EndpointNotFound(id))
    }

    pub fn contains(&self, id: EndpointId) -> bool {
        self.find(id).is_ok()
    }

    /// Destroy an endpoint
    ///
    /// In-flight transfers are only marked for cancellation here; each is released
    /// when its own completion reaches the endpoint's queue.
    pub fn destroy(&self, id: EndpointId) -> Result<()> {
        let endpoint = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .ok_or(Error::EndpointNotFound(id))?;

        self.retire(endpoint);
        Ok(())
    }

    /// Destroy every endpoint
    pub fn destroy_all(&self) {
        let drained: Vec<Arc<Endpoint>> = self
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();

        for endpoint in drained {
            self.retire(endpoint);
        }
    }

    fn retire(&self, endpoint: Arc<Endpoint>) {
        let id = endpoint.id();
        endpoint.mark_destroyed();

        let handles = endpoint.inflight_handles();
        for handle in &handles {
            self.port.cancel(id, *handle);
        }
        // The worker may already be gone if the adapter is shutting down
        let _ = endpoint.post(EndpointEvent::Shutdown);

        debug!(
            "Destroyed endpoint {} ({} transfers canceled)",
            id,
            handles.len()
        );
    }

    pub fn identities(&self) -> Vec<EndpointId> {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
