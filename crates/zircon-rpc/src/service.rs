//! Service handlers and the registry the server dispatches through.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use zircon_types::{Result, ZirconError};

/// Trait implemented by RPC service handlers.
///
/// Each service is identified by a numeric `service_id` and exposes
/// methods identified by `method_id`. The handler receives a raw request
/// payload and returns a raw response payload.
///
/// Handlers embed application-level failures inside their typed response
/// bodies (error string fields); an `Err` from [`ServiceHandler::handle`]
/// means the request itself could not be dispatched or decoded, and the
/// server reports it through the response envelope's error status.
#[async_trait]
pub trait ServiceHandler: Send + Sync {
    /// Unique numeric identifier for this service.
    fn service_id(&self) -> u16;

    /// Human-readable name, used for logging.
    fn service_name(&self) -> &str;

    /// Dispatch a method call.
    async fn handle(&self, method_id: u16, request: Bytes) -> Result<Bytes>;
}

/// Registry mapping service ids to their handlers.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<u16, Arc<dyn ServiceHandler>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same id.
    pub fn register(&self, service: Arc<dyn ServiceHandler>) {
        self.services.insert(service.service_id(), service);
    }

    pub fn get(&self, service_id: u16) -> Option<Arc<dyn ServiceHandler>> {
        self.services
            .get(&service_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn unregister(&self, service_id: u16) -> bool {
        self.services.remove(&service_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Method not known to the target service.
pub fn unknown_method(service: &str, method_id: u16) -> ZirconError {
    ZirconError::Transport(format!("{service}: unknown method id {method_id}"))
}
