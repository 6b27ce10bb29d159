//! etcd registry backend

use crate::backend::{RegistryBackend, RegistryError, ServiceEvent, WatchHandler};
use crate::instance::{HealthStatus, ServiceInstance};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry backend speaking to etcd through the v3 JSON gateway.
///
/// Instances are stored as JSON values under `<prefix>/<id>`; change watching
/// is a poll-diff loop over the key range.
pub struct EtcdBackend {
    base_url: String,
    prefix: String,
    client: reqwest::Client,
    watch_interval: Duration,
    watch_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl EtcdBackend {
    /// Create a new etcd backend.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use gantry::EtcdBackend;
    ///
    /// let etcd = EtcdBackend::new("http://localhost:2379", "/services")?;
    /// ```
    pub fn new(
        base_url: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Result<Self, RegistryError> {
        Ok(Self {
            base_url: base_url.into(),
            prefix: prefix.into(),
            client: reqwest::Client::new(),
            watch_interval: Duration::from_secs(10),
            watch_tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Set the poll interval for watch subscriptions.
    pub fn with_watch_interval(mut self, interval: Duration) -> Self {
        self.watch_interval = interval;
        self
    }

    fn instance_key(&self, id: &str) -> String {
        format!("{}/{}", self.prefix, id)
    }

    async fn put_instance(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let url = format!("{}/v3/kv/put", self.base_url);
        let key = self.instance_key(&instance.id);
        let value = serde_json::to_string(instance)
            .map_err(|e| RegistryError::InvalidConfiguration(e.to_string()))?;

        let payload = serde_json::json!({
            "key": general_purpose::STANDARD.encode(key.as_bytes()),
            "value": general_purpose::STANDARD.encode(value.as_bytes()),
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let error = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(RegistryError::RegistrationFailed(error))
        }
    }

    /// Fetch and decode every instance under the key prefix.
    async fn scan(&self) -> Result<Vec<ServiceInstance>, RegistryError> {
        let url = format!("{}/v3/kv/range", self.base_url);
        let start = format!("{}/", self.prefix);

        let payload = serde_json::json!({
            "key": general_purpose::STANDARD.encode(start.as_bytes()),
            "range_end": general_purpose::STANDARD.encode(format!("{}~", start).as_bytes()),
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if !response.status().is_success() {
            let error = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(RegistryError::InvalidConfiguration(error));
        }

        #[derive(Deserialize)]
        struct RangeResponse {
            #[serde(default)]
            kvs: Vec<KeyValue>,
        }

        #[derive(Deserialize)]
        struct KeyValue {
            value: String,
        }

        let range: RangeResponse = response.json().await?;

        let mut instances = Vec::with_capacity(range.kvs.len());
        for kv in range.kvs {
            let raw = general_purpose::STANDARD
                .decode(&kv.value)
                .map_err(|e| RegistryError::InvalidConfiguration(e.to_string()))?;
            match serde_json::from_slice::<ServiceInstance>(&raw) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(error = %e, "skipping undecodable etcd entry"),
            }
        }

        Ok(instances)
    }
}

impl Drop for EtcdBackend {
    fn drop(&mut self) {
        for task in self.watch_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl RegistryBackend for EtcdBackend {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        self.put_instance(instance).await?;
        info!("Registered service {} with etcd", instance.id);
        Ok(())
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/v3/kv/deleterange", self.base_url);
        let key = self.instance_key(id);

        let payload = serde_json::json!({
            "key": general_purpose::STANDARD.encode(key.as_bytes()),
        });

        let response = self.client.post(&url).json(&payload).send().await?;

        if response.status().is_success() {
            info!("Deregistered service {} from etcd", id);
            Ok(())
        } else {
            let error = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(RegistryError::DeregistrationFailed(error))
        }
    }

    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let instances: Vec<ServiceInstance> = self
            .scan()
            .await?
            .into_iter()
            .filter(|i| i.name == service)
            .collect();

        debug!(
            "Discovered {} instances of service {}",
            instances.len(),
            service
        );
        Ok(instances)
    }

    async fn watch(&self, service: &str, handler: WatchHandler) -> Result<(), RegistryError> {
        // Poll-diff loop; the v3 gateway's streaming watch is not worth the
        // dependency weight for an adapter.
        let backend = EtcdBackend {
            base_url: self.base_url.clone(),
            prefix: self.prefix.clone(),
            client: self.client.clone(),
            watch_interval: self.watch_interval,
            watch_tasks: parking_lot::Mutex::new(Vec::new()),
        };
        let service = service.to_string();
        let interval = self.watch_interval;

        let task = tokio::spawn(async move {
            let mut known: HashMap<String, ServiceInstance> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let instances = match backend.discover(&service).await {
                    Ok(instances) => instances,
                    Err(e) => {
                        warn!(service = %service, error = %e, "etcd watch poll failed");
                        continue;
                    }
                };

                let current: HashMap<String, ServiceInstance> =
                    instances.into_iter().map(|i| (i.id.clone(), i)).collect();

                for (id, instance) in &current {
                    match known.get(id) {
                        None => deliver(&handler, ServiceEvent::Registered, instance),
                        Some(previous) if previous.health.status != instance.health.status => {
                            deliver(&handler, ServiceEvent::HealthChanged, instance)
                        }
                        Some(previous) if registration_changed(previous, instance) => {
                            deliver(&handler, ServiceEvent::Updated, instance)
                        }
                        Some(_) => {}
                    }
                }
                for (id, instance) in &known {
                    if !current.contains_key(id) {
                        deliver(&handler, ServiceEvent::Deregistered, instance);
                    }
                }

                known = current;
            }
        });

        self.watch_tasks.lock().push(task);
        Ok(())
    }

    async fn update_health(&self, id: &str, health: &HealthStatus) -> Result<(), RegistryError> {
        let mut instance = self
            .scan()
            .await?
            .into_iter()
            .find(|i| i.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        instance.health = health.clone();
        self.put_instance(&instance)
            .await
            .map_err(|e| RegistryError::HealthUpdateFailed(e.to_string()))
    }
}

fn registration_changed(previous: &ServiceInstance, current: &ServiceInstance) -> bool {
    previous.address != current.address
        || previous.port != current.port
        || previous.version != current.version
        || previous.weight != current.weight
        || previous.tags != current.tags
}

fn deliver(handler: &WatchHandler, event: ServiceEvent, instance: &ServiceInstance) {
    if let Err(e) = (*handler)(event, instance) {
        warn!(
            service = %instance.name,
            event = %event,
            error = %e,
            "watch handler failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etcd_backend_creation() {
        let etcd = EtcdBackend::new("http://localhost:2379", "/services");
        assert!(etcd.is_ok());
    }

    #[test]
    fn test_instance_key_scheme() {
        let etcd = EtcdBackend::new("http://localhost:2379", "/services").unwrap();
        assert_eq!(etcd.instance_key("api-1"), "/services/api-1");
    }
}
