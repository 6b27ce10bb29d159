//! Instance health checking
//!
//! Runs a fixed sequence of probes against a single service instance and
//! derives a [`HealthStatus`] verdict. Scheduling of periodic checks is owned
//! by the registry; this module only knows how to probe one instance.

use crate::instance::{HealthCheck, HealthStatus, Protocol, ServiceInstance};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::debug;
use url::Url;

/// Health checker configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckerConfig {
    /// Hard timeout for the TCP connectivity probe.
    pub connect_timeout: Duration,
    /// Hard timeout for each remaining probe, so one unreachable instance
    /// cannot starve a sweep.
    pub probe_timeout: Duration,
    /// Latency above which the response-time probe reports a warning.
    pub response_time_threshold: Duration,
}

impl Default for HealthCheckerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(5),
            response_time_threshold: Duration::from_millis(5000),
        }
    }
}

/// Probes service instances and computes health verdicts.
pub struct HealthChecker {
    config: HealthCheckerConfig,
    client: reqwest::Client,
    monitored: RwLock<HashMap<String, ServiceInstance>>,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    /// Create a health checker with default timeouts.
    pub fn new() -> Self {
        Self::with_config(HealthCheckerConfig::default())
    }

    /// Create a health checker with custom timeouts.
    pub fn with_config(config: HealthCheckerConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            monitored: RwLock::new(HashMap::new()),
        }
    }

    /// Register an instance for periodic checking.
    pub async fn monitor(&self, instance: ServiceInstance) {
        debug!(id = %instance.id, service = %instance.name, "monitoring instance");
        self.monitored
            .write()
            .await
            .insert(instance.id.clone(), instance);
    }

    /// Unregister an instance from periodic checking.
    pub async fn unmonitor(&self, id: &str) {
        if self.monitored.write().await.remove(id).is_some() {
            debug!(id = %id, "stopped monitoring instance");
        }
    }

    /// Snapshot of the currently monitored instances.
    pub async fn monitored(&self) -> Vec<ServiceInstance> {
        self.monitored.read().await.values().cloned().collect()
    }

    /// Number of monitored instances.
    pub async fn monitored_count(&self) -> usize {
        self.monitored.read().await.len()
    }

    /// Drop all monitored instances.
    pub async fn clear(&self) {
        self.monitored.write().await.clear();
    }

    /// Run the check sequence against one instance and derive its health.
    ///
    /// Side-effect-free: the instance itself is not mutated. If the sequence
    /// cannot complete (e.g. the probe URL cannot be built), the verdict
    /// degrades to a single synthetic failing connectivity entry carrying the
    /// error text.
    pub async fn check_health(&self, instance: &ServiceInstance) -> HealthStatus {
        match self.run_checks(instance).await {
            Ok(checks) => HealthStatus::from_checks(checks),
            Err(e) => HealthStatus::from_checks(vec![
                HealthCheck::fail("connectivity").with_output(e.to_string()),
            ]),
        }
    }

    async fn run_checks(
        &self,
        instance: &ServiceInstance,
    ) -> Result<Vec<HealthCheck>, url::ParseError> {
        // Resolve the probe base up front; an unbuildable URL aborts the
        // sequence before any probe runs.
        let scheme = match instance.protocol {
            Protocol::Https => "https",
            Protocol::Http | Protocol::Grpc => "http",
        };
        let base = Url::parse(&format!(
            "{}://{}:{}",
            scheme, instance.address, instance.port
        ))?;

        let mut checks = Vec::with_capacity(3);
        checks.push(self.check_connectivity(instance).await);

        if let Some(path) = instance.health_endpoint() {
            let url = base.join(path)?;
            checks.push(self.check_endpoint(url).await);
        }

        checks.push(self.check_response_time(instance).await);
        Ok(checks)
    }

    async fn check_connectivity(&self, instance: &ServiceInstance) -> HealthCheck {
        let start = Instant::now();
        let connect = TcpStream::connect((instance.address.as_str(), instance.port));

        let check = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(_)) => HealthCheck::pass("connectivity"),
            Ok(Err(e)) => HealthCheck::fail("connectivity").with_output(e.to_string()),
            Err(_) => HealthCheck::fail("connectivity").with_output(format!(
                "connect timed out after {:?}",
                self.config.connect_timeout
            )),
        };
        check.with_duration(start.elapsed())
    }

    async fn check_endpoint(&self, url: Url) -> HealthCheck {
        let start = Instant::now();
        let request = self.client.get(url.clone()).send();

        let check = match tokio::time::timeout(self.config.probe_timeout, request).await {
            Ok(Ok(response)) if response.status().is_success() => {
                HealthCheck::pass("health-endpoint").with_output(response.status().to_string())
            }
            Ok(Ok(response)) => {
                HealthCheck::fail("health-endpoint").with_output(response.status().to_string())
            }
            Ok(Err(e)) => HealthCheck::fail("health-endpoint").with_output(e.to_string()),
            Err(_) => HealthCheck::fail("health-endpoint").with_output(format!(
                "request timed out after {:?}",
                self.config.probe_timeout
            )),
        };
        check.with_duration(start.elapsed())
    }

    /// Latency probe. Exceeding the threshold is a quality warning, not a
    /// failure; an unreachable instance is already reported by connectivity.
    async fn check_response_time(&self, instance: &ServiceInstance) -> HealthCheck {
        let start = Instant::now();
        let connect = TcpStream::connect((instance.address.as_str(), instance.port));
        let outcome = tokio::time::timeout(self.config.probe_timeout, connect).await;
        let elapsed = start.elapsed();

        let check = match outcome {
            Ok(Ok(_)) if elapsed <= self.config.response_time_threshold => {
                HealthCheck::pass("response-time")
                    .with_output(format!("{}ms", elapsed.as_millis()))
            }
            Ok(Ok(_)) => HealthCheck::warn("response-time").with_output(format!(
                "{}ms exceeds threshold of {}ms",
                elapsed.as_millis(),
                self.config.response_time_threshold.as_millis()
            )),
            Ok(Err(e)) => HealthCheck::warn("response-time").with_output(e.to_string()),
            Err(_) => HealthCheck::warn("response-time").with_output(format!(
                "probe timed out after {:?}",
                self.config.probe_timeout
            )),
        };
        check.with_duration(elapsed)
    }
}
