//! Service Resilience and Discovery for Distributed Services
//!
//! This crate provides the building blocks for calling other services
//! without falling over when they do:
//!
//! - **Service Registry** - register instances, discover healthy ones,
//!   watch for changes
//! - **Health Checking** - periodic and on-demand instance probing
//! - **Load Balancing** - round-robin, weighted, least-connections, random,
//!   ip-hash, or health-based selection
//! - **Circuit Breaking** - per-dependency fault isolation
//! - **Multiple Backends** - Consul, etcd, or in-memory
//!
//! ## Quick Start
//!
//! ### In-Memory Registry (Testing)
//!
//! ```rust,ignore
//! use gantry::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
//!
//!     let instance = ServiceInstance::new("api-1", "api", "1.0.0", "localhost", 8080)
//!         .with_tag("v1")
//!         .with_endpoint("/health");
//!
//!     registry.register(instance).await?;
//!
//!     for instance in registry.discover("api").await? {
//!         println!("Found: {}", instance.url());
//!     }
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ### A Resilient Call
//!
//! ```rust,ignore
//! use gantry::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
//! let balancer = LoadBalancer::new(BalancingAlgorithm::RoundRobin);
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("api").recovery_timeout(Duration::from_secs(30)),
//! );
//!
//! // discover -> select -> execute-with-breaker
//! balancer.update_services("api", registry.discover("api").await?);
//! let instance = balancer.select_service("api")?;
//!
//! let result = breaker.execute(|| call_instance(&instance)).await;
//! match result {
//!     Ok(_) => balancer.record_success(&instance.id, 12.0),
//!     Err(_) => balancer.record_failure(&instance.id),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Consul Backend
//!
//! ```rust,ignore
//! use gantry::*;
//! use std::sync::Arc;
//!
//! let consul = ConsulBackend::new("http://localhost:8500")?;
//! let registry = ServiceRegistry::new(Arc::new(consul));
//! ```

pub mod backend;
pub mod balancer;
pub mod breaker;
pub mod consul;
pub mod etcd;
pub mod health;
pub mod instance;
pub mod memory;
pub mod registry;

pub use backend::{RegistryBackend, RegistryError, ServiceEvent, WatchHandler};
pub use balancer::{BalancerError, BalancingAlgorithm, LoadBalancer, ServiceStats};
pub use breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerMetrics, CircuitState,
};
pub use consul::ConsulBackend;
pub use etcd::EtcdBackend;
pub use health::{HealthChecker, HealthCheckerConfig};
pub use instance::{
    CheckOutcome, HealthCheck, HealthState, HealthStatus, Protocol, ServiceInstance,
};
pub use memory::InMemoryBackend;
pub use registry::{RegistryConfig, ServiceRegistry};
