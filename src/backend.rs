//! Registry backend contract and shared error taxonomy
//!
//! The registry delegates durable storage to a [`RegistryBackend`]. The
//! in-memory implementation is the reference backend for tests; the Consul
//! and etcd adapters speak to real stores over HTTP.

use crate::instance::{HealthStatus, ServiceInstance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Registry and backend errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error("service instance not found: {0}")]
    NotFound(String),

    #[error("discovery failed for service {service}: {reason}")]
    Discovery { service: String, reason: String },

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("deregistration failed: {0}")]
    DeregistrationFailed(String),

    #[error("watch failed: {0}")]
    WatchFailed(String),

    #[error("health update failed: {0}")]
    HealthUpdateFailed(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
}

/// Change event delivered to watchers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServiceEvent {
    /// An instance was registered
    Registered,
    /// An instance was deregistered
    Deregistered,
    /// An instance's health state transitioned
    HealthChanged,
    /// An instance's registration data changed
    Updated,
}

impl std::fmt::Display for ServiceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered => write!(f, "registered"),
            Self::Deregistered => write!(f, "deregistered"),
            Self::HealthChanged => write!(f, "health-changed"),
            Self::Updated => write!(f, "updated"),
        }
    }
}

/// Callback invoked for each change event on a watched service name.
///
/// A handler returning `Err` is logged and skipped; it never aborts delivery
/// to the remaining handlers.
pub type WatchHandler = Arc<
    dyn Fn(ServiceEvent, &ServiceInstance) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync,
>;

/// Durable store of truth for service instances.
///
/// The registry keeps a local cache in front of the backend; the backend
/// dictates conflict policy on duplicate registration.
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// Persist a service instance registration.
    async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError>;

    /// Remove a service instance by id.
    async fn deregister(&self, id: &str) -> Result<(), RegistryError>;

    /// Fetch all instances of a logical service, healthy or not.
    async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError>;

    /// Subscribe to change events for a logical service.
    async fn watch(&self, service: &str, handler: WatchHandler) -> Result<(), RegistryError>;

    /// Persist a health transition for an instance.
    async fn update_health(&self, id: &str, health: &HealthStatus) -> Result<(), RegistryError>;
}
