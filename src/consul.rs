//! Consul registry backend

use crate::backend::{RegistryBackend, RegistryError, ServiceEvent, WatchHandler};
use crate::instance::{HealthCheck, HealthState, HealthStatus, Protocol, ServiceInstance};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Registry backend speaking to a Consul agent over its HTTP API.
///
/// Health transitions are pushed through a TTL check registered alongside the
/// service; change watching is a poll-diff loop against the health API.
pub struct ConsulBackend {
    base_url: String,
    client: reqwest::Client,
    watch_interval: Duration,
    watch_tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ConsulBackend {
    /// Create a new Consul backend.
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// use gantry::ConsulBackend;
    ///
    /// let consul = ConsulBackend::new("http://localhost:8500")?;
    /// ```
    pub fn new(base_url: impl Into<String>) -> Result<Self, RegistryError> {
        Ok(Self {
            base_url: base_url.into(),
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

    fn check_id(service_id: &str) -> String {
        format!("service:{}", service_id)
    }
}

impl Drop for ConsulBackend {
    fn drop(&mut self) {
        for task in self.watch_tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[derive(Deserialize)]
struct ConsulHealthEntry {
    #[serde(rename = "Service")]
    service: ConsulServiceDetail,
    #[serde(rename = "Checks", default)]
    checks: Vec<ConsulCheck>,
}

#[derive(Deserialize)]
struct ConsulServiceDetail {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Service")]
    service: String,
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Tags", default)]
    tags: Vec<String>,
    #[serde(rename = "Meta")]
    meta: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct ConsulCheck {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "Output", default)]
    output: String,
}

fn instance_from_entry(entry: ConsulHealthEntry) -> ServiceInstance {
    let meta = entry.service.meta.unwrap_or_default();
    let version = meta.get("version").cloned().unwrap_or_default();
    let weight = meta
        .get("weight")
        .and_then(|w| w.parse().ok())
        .unwrap_or(1);
    let protocol = meta
        .get("protocol")
        .and_then(|p| p.parse::<Protocol>().ok())
        .unwrap_or_default();
    let endpoints: Vec<String> = meta
        .get("endpoints")
        .map(|e| e.split(',').map(str::to_string).collect())
        .unwrap_or_default();

    let checks: Vec<HealthCheck> = entry
        .checks
        .iter()
        // The always-passing serf check carries no signal for instance health
        .filter(|c| c.name != "Serf Health Status")
        .map(|c| {
            let check = match c.status.as_str() {
                "passing" => HealthCheck::pass(&c.name),
                "warning" => HealthCheck::warn(&c.name),
                _ => HealthCheck::fail(&c.name),
            };
            if c.output.is_empty() {
                check
            } else {
                check.with_output(&c.output)
            }
        })
        .collect();

    let health = if checks.is_empty() {
        HealthStatus::healthy()
    } else {
        HealthStatus::from_checks(checks)
    };

    let mut instance = ServiceInstance::new(
        entry.service.id,
        entry.service.service,
        version,
        entry.service.address,
        entry.service.port,
    );
    instance.tags = entry.service.tags;
    instance.protocol = protocol;
    instance.weight = weight;
    instance.endpoints = endpoints;
    instance.health = health;
    instance.metadata = meta;
    instance
}

#[async_trait]
impl RegistryBackend for ConsulBackend {
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/register", self.base_url);

        let mut meta = instance.metadata.clone();
        meta.insert("version".to_string(), instance.version.clone());
        meta.insert("weight".to_string(), instance.weight.to_string());
        meta.insert("protocol".to_string(), instance.protocol.to_string());
        if !instance.endpoints.is_empty() {
            meta.insert("endpoints".to_string(), instance.endpoints.join(","));
        }

        // TTL check so health transitions can be pushed via check update
        let payload = serde_json::json!({
            "ID": instance.id,
            "Name": instance.name,
            "Address": instance.address,
            "Port": instance.port,
            "Tags": instance.tags,
            "Meta": meta,
            "Check": {
                "CheckID": Self::check_id(&instance.id),
                "Name": "instance health",
                "TTL": "90s",
                "Status": "passing",
            },
        });

        let response = self.client.put(&url).json(&payload).send().await?;

        if response.status().is_success() {
            info!("Registered service {} with Consul", instance.id);
            Ok(())
        } else {
            let error = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(RegistryError::RegistrationFailed(error))
        }
    }

    async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let url = format!("{}/v1/agent/service/deregister/{}", self.base_url, id);

        let response = self.client.put(&url).send().await?;

        if response.status().is_success() {
            info!("Deregistered service {} from Consul", id);
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
        let url = format!("{}/v1/health/service/{}", self.base_url, service);

        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(RegistryError::Discovery {
                service: service.to_string(),
                reason: response.status().to_string(),
            });
        }

        let entries: Vec<ConsulHealthEntry> = response.json().await?;
        let instances: Vec<ServiceInstance> = entries.into_iter().map(instance_from_entry).collect();

        debug!(
            "Discovered {} instances of service {}",
            instances.len(),
            service
        );
        Ok(instances)
    }

    async fn watch(&self, service: &str, handler: WatchHandler) -> Result<(), RegistryError> {
        let client = self.client.clone();
        let base_url = self.base_url.clone();
        let service = service.to_string();
        let interval = self.watch_interval;

        let task = tokio::spawn(async move {
            let mut known: HashMap<String, ServiceInstance> = HashMap::new();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                let url = format!("{}/v1/health/service/{}", base_url, service);
                let entries: Vec<ConsulHealthEntry> = match client.get(&url).send().await {
                    Ok(response) => match response.json().await {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!(service = %service, error = %e, "consul watch decode failed");
                            continue;
                        }
                    },
                    Err(e) => {
                        warn!(service = %service, error = %e, "consul watch poll failed");
                        continue;
                    }
                };

                let current: HashMap<String, ServiceInstance> = entries
                    .into_iter()
                    .map(instance_from_entry)
                    .map(|i| (i.id.clone(), i))
                    .collect();

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
        let url = format!(
            "{}/v1/agent/check/update/{}",
            self.base_url,
            Self::check_id(id)
        );

        let status = match health.status {
            HealthState::Healthy => "passing",
            HealthState::Warning => "warning",
            HealthState::Unhealthy => "critical",
        };
        let output: Vec<String> = health
            .checks
            .iter()
            .map(|c| {
                format!(
                    "{}: {:?}{}",
                    c.name,
                    c.status,
                    c.output
                        .as_deref()
                        .map(|o| format!(" ({})", o))
                        .unwrap_or_default()
                )
            })
            .collect();

        let payload = serde_json::json!({
            "Status": status,
            "Output": output.join("; "),
        });

        let response = self.client.put(&url).json(&payload).send().await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let error = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            Err(RegistryError::HealthUpdateFailed(error))
        }
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
    use crate::instance::CheckOutcome;

    #[test]
    fn test_consul_backend_creation() {
        let consul = ConsulBackend::new("http://localhost:8500");
        assert!(consul.is_ok());
    }

    #[test]
    fn test_instance_from_entry_maps_health() {
        let entry = ConsulHealthEntry {
            service: ConsulServiceDetail {
                id: "api-1".to_string(),
                service: "api".to_string(),
                address: "10.0.0.5".to_string(),
                port: 8080,
                tags: vec!["edge".to_string()],
                meta: Some(HashMap::from([
                    ("version".to_string(), "1.4.2".to_string()),
                    ("weight".to_string(), "3".to_string()),
                    ("protocol".to_string(), "grpc".to_string()),
                ])),
            },
            checks: vec![
                ConsulCheck {
                    name: "Serf Health Status".to_string(),
                    status: "passing".to_string(),
                    output: String::new(),
                },
                ConsulCheck {
                    name: "instance health".to_string(),
                    status: "warning".to_string(),
                    output: "slow".to_string(),
                },
            ],
        };

        let instance = instance_from_entry(entry);
        assert_eq!(instance.version, "1.4.2");
        assert_eq!(instance.weight, 3);
        assert_eq!(instance.protocol, Protocol::Grpc);
        assert_eq!(instance.health.status, HealthState::Warning);
        assert_eq!(instance.health.checks.len(), 1);
        assert_eq!(instance.health.checks[0].status, CheckOutcome::Warn);
    }
}
