//! In-memory registry backend (reference implementation, for testing)

use crate::backend::{RegistryBackend, RegistryError, ServiceEvent, WatchHandler};
use crate::instance::{HealthStatus, ServiceInstance};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// In-memory registry backend.
///
/// Last write wins on duplicate-id registration. Watch handlers fire
/// synchronously on every mutation, in registration order per service name.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    services: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    watchers: Arc<parking_lot::RwLock<HashMap<String, Vec<WatchHandler>>>>,
}

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all registered services and watchers.
    pub async fn clear(&self) {
        self.services.write().await.clear();
        self.watchers.write().clear();
    }

    /// Get count of registered instances.
    pub async fn count(&self) -> usize {
        self.services.read().await.len()
    }

    fn notify(&self, event: ServiceEvent, instance: &ServiceInstance) {
        let handlers: Vec<WatchHandler> = self
            .watchers
            .read()
            .get(&instance.name)
            .map(|h| h.to_vec())
            .unwrap_or_default();

        for handler in handlers {
            if let Err(e) = (*handler)(event, instance) {
                warn!(
                    service = %instance.name,
                    event = %event,
                    error = %e,
                    "watch handler failed"
                );
            }
        }
    }
}

#[async_trait]
impl RegistryBackend for InMemoryBackend {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.services
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        self.notify(ServiceEvent::Registered, instance);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self
            .services
            .write()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.notify(ServiceEvent::Deregistered, &removed);
        Ok(())
    }

    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let services = self.services.read().await;
        Ok(services
            .values()
            .filter(|s| s.name == service)
            .cloned()
            .collect())
    }

    async fn watch(&self, service: &str, handler: WatchHandler) -> Result<(), RegistryError> {
        self.watchers
            .write()
            .entry(service.to_string())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn update_health(&self, id: &str, health: &HealthStatus) -> Result<(), RegistryError> {
        let updated = {
            let mut services = self.services.write().await;
            let instance = services
                .get_mut(id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            instance.health = health.clone();
            instance.clone()
        };
        self.notify(ServiceEvent::HealthChanged, &updated);
        Ok(())
    }
}
