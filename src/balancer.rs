//! Multi-algorithm service instance selection
//!
//! The balancer selects one instance per call from a caller-supplied
//! candidate set and keeps rolling usage statistics. It never talks to the
//! registry; candidate lists are installed with [`LoadBalancer::update_services`].

use crate::instance::{ServiceInstance, current_timestamp};
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tracing::debug;

/// Load balancer errors
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("no healthy instances available for service: {0}")]
    NoHealthyInstances(String),

    #[error("unknown balancing algorithm: {0}")]
    UnknownAlgorithm(String),
}

/// Instance selection algorithm. Switchable at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalancingAlgorithm {
    /// Per-service monotonic counter modulo candidate count
    #[default]
    RoundRobin,
    /// Uniform draw over the summed instance weights
    Weighted,
    /// Fewest active connections wins, ties broken by list order
    LeastConnections,
    /// Uniform pick over the candidate list
    Random,
    /// Deterministic hash of a client key modulo candidate count
    IpHash,
    /// Composite score of health state, success rate, latency, and load
    HealthBased,
}

impl std::fmt::Display for BalancingAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::Weighted => write!(f, "weighted"),
            Self::LeastConnections => write!(f, "least-connections"),
            Self::Random => write!(f, "random"),
            Self::IpHash => write!(f, "ip-hash"),
            Self::HealthBased => write!(f, "health-based"),
        }
    }
}

impl std::str::FromStr for BalancingAlgorithm {
    type Err = BalancerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round-robin" => Ok(Self::RoundRobin),
            "weighted" => Ok(Self::Weighted),
            "least-connections" => Ok(Self::LeastConnections),
            "random" => Ok(Self::Random),
            "ip-hash" => Ok(Self::IpHash),
            "health-based" => Ok(Self::HealthBased),
            other => Err(BalancerError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// Rolling usage statistics for one instance.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Selections handed out for this instance
    pub requests: u64,
    /// Fleet-wide success ratio, 0-100, duplicated into each entry
    pub success_rate: f64,
    /// Running mean response time in milliseconds
    pub average_response_time: f64,
    /// Selections not yet completed via record_success/record_failure
    pub active_connections: u32,
    /// Unix timestamp (seconds) of the most recent selection
    pub last_used: u64,
}

impl Default for ServiceStats {
    fn default() -> Self {
        Self {
            requests: 0,
            success_rate: 100.0,
            average_response_time: 0.0,
            active_connections: 0,
            last_used: 0,
        }
    }
}

struct BalancerInner {
    algorithm: BalancingAlgorithm,
    services: HashMap<String, Vec<ServiceInstance>>,
    stats: HashMap<String, ServiceStats>,
    response_samples: HashMap<String, u64>,
    rr_counters: HashMap<String, usize>,
    total_requests: u64,
    total_successes: u64,
    total_failures: u64,
}

impl BalancerInner {
    fn global_success_rate(&self) -> f64 {
        let completed = self.total_successes + self.total_failures;
        if completed == 0 {
            100.0
        } else {
            self.total_successes as f64 / completed as f64 * 100.0
        }
    }

    fn active_connections(&self, id: &str) -> u32 {
        self.stats.get(id).map(|s| s.active_connections).unwrap_or(0)
    }
}

/// Selects one instance per call from a candidate set.
pub struct LoadBalancer {
    health_filter: bool,
    inner: RwLock<BalancerInner>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(BalancingAlgorithm::RoundRobin)
    }
}

impl LoadBalancer {
    /// Create a balancer that filters candidates down to healthy instances.
    pub fn new(algorithm: BalancingAlgorithm) -> Self {
        Self {
            health_filter: true,
            inner: RwLock::new(BalancerInner {
                algorithm,
                services: HashMap::new(),
                stats: HashMap::new(),
                response_samples: HashMap::new(),
                rr_counters: HashMap::new(),
                total_requests: 0,
                total_successes: 0,
                total_failures: 0,
            }),
        }
    }

    /// Create a balancer that considers every supplied candidate, healthy
    /// or not.
    pub fn without_health_filter(algorithm: BalancingAlgorithm) -> Self {
        Self {
            health_filter: false,
            ..Self::new(algorithm)
        }
    }

    /// Install the candidate list for a logical service.
    pub fn update_services(&self, service: &str, instances: Vec<ServiceInstance>) {
        debug!(service = %service, count = instances.len(), "updating candidate list");
        self.inner
            .write()
            .services
            .insert(service.to_string(), instances);
    }

    /// Switch the selection algorithm at runtime.
    pub fn set_algorithm(&self, algorithm: BalancingAlgorithm) {
        self.inner.write().algorithm = algorithm;
    }

    /// The currently configured algorithm.
    pub fn algorithm(&self) -> BalancingAlgorithm {
        self.inner.read().algorithm
    }

    /// Select one instance for a service.
    ///
    /// For `ip-hash` this uses a placeholder key; callers with a real client
    /// key should use [`select_service_with_key`](Self::select_service_with_key).
    pub fn select_service(&self, service: &str) -> Result<ServiceInstance, BalancerError> {
        self.select(service, None)
    }

    /// Select one instance for a service, hashing `key` under `ip-hash`.
    pub fn select_service_with_key(
        &self,
        service: &str,
        key: &str,
    ) -> Result<ServiceInstance, BalancerError> {
        self.select(service, Some(key))
    }

    fn select(&self, service: &str, key: Option<&str>) -> Result<ServiceInstance, BalancerError> {
        let mut inner = self.inner.write();

        let candidates = inner.services.get(service).cloned().unwrap_or_default();
        let eligible: Vec<&ServiceInstance> = if self.health_filter {
            candidates.iter().filter(|i| i.health.is_healthy()).collect()
        } else {
            candidates.iter().collect()
        };

        if eligible.is_empty() {
            return Err(BalancerError::NoHealthyInstances(service.to_string()));
        }

        let idx = match inner.algorithm {
            BalancingAlgorithm::RoundRobin => {
                let counter = inner.rr_counters.entry(service.to_string()).or_insert(0);
                let idx = *counter % eligible.len();
                *counter = counter.wrapping_add(1);
                idx
            }
            BalancingAlgorithm::Weighted => {
                let total: u64 = eligible.iter().map(|i| i.weight.max(1) as u64).sum();
                let mut remaining = rand::rng().random_range(0..total) as i64;
                let mut idx = eligible.len() - 1;
                for (i, instance) in eligible.iter().enumerate() {
                    remaining -= instance.weight.max(1) as i64;
                    if remaining < 0 {
                        idx = i;
                        break;
                    }
                }
                idx
            }
            BalancingAlgorithm::LeastConnections => {
                let mut idx = 0;
                let mut min_active = u32::MAX;
                for (i, instance) in eligible.iter().enumerate() {
                    let active = inner.active_connections(&instance.id);
                    if active < min_active {
                        min_active = active;
                        idx = i;
                    }
                }
                idx
            }
            BalancingAlgorithm::Random => rand::rng().random_range(0..eligible.len()),
            BalancingAlgorithm::IpHash => {
                let mut hasher = DefaultHasher::new();
                key.unwrap_or("default").hash(&mut hasher);
                (hasher.finish() % eligible.len() as u64) as usize
            }
            BalancingAlgorithm::HealthBased => {
                let mut idx = 0;
                let mut best = f64::MIN;
                for (i, instance) in eligible.iter().enumerate() {
                    let score = self.health_score(&inner, instance);
                    if score > best {
                        best = score;
                        idx = i;
                    }
                }
                idx
            }
        };

        let chosen = eligible[idx].clone();

        let stats = inner.stats.entry(chosen.id.clone()).or_default();
        stats.requests += 1;
        stats.active_connections += 1;
        stats.last_used = current_timestamp();
        inner.total_requests += 1;

        Ok(chosen)
    }

    fn health_score(&self, inner: &BalancerInner, instance: &ServiceInstance) -> f64 {
        use crate::instance::HealthState;

        let status_weight = match instance.health.status {
            HealthState::Healthy => 50.0,
            HealthState::Warning => 25.0,
            HealthState::Unhealthy => 0.0,
        };

        let (success_rate, avg_response, active) = inner
            .stats
            .get(&instance.id)
            .map(|s| (s.success_rate, s.average_response_time, s.active_connections))
            .unwrap_or((100.0, 0.0, 0));

        status_weight + success_rate / 100.0 * 30.0
            - (avg_response / 1000.0).min(10.0)
            - (active as f64 / 10.0).min(10.0)
    }

    /// Record a completed, successful call against an instance.
    pub fn record_success(&self, id: &str, response_time_ms: f64) {
        let mut inner = self.inner.write();
        inner.total_successes += 1;
        let rate = inner.global_success_rate();

        let samples = inner.response_samples.entry(id.to_string()).or_insert(0);
        *samples += 1;
        let n = *samples;

        let stats = inner.stats.entry(id.to_string()).or_default();
        stats.active_connections = stats.active_connections.saturating_sub(1);
        stats.average_response_time += (response_time_ms - stats.average_response_time) / n as f64;
        stats.success_rate = rate;
    }

    /// Record a completed, failed call against an instance.
    pub fn record_failure(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.total_failures += 1;
        let rate = inner.global_success_rate();

        let stats = inner.stats.entry(id.to_string()).or_default();
        stats.active_connections = stats.active_connections.saturating_sub(1);
        stats.success_rate = rate;
    }

    /// Statistics for one instance, if it has ever been selected or recorded.
    pub fn stats(&self, id: &str) -> Option<ServiceStats> {
        self.inner.read().stats.get(id).cloned()
    }

    /// Statistics for every tracked instance.
    pub fn all_stats(&self) -> HashMap<String, ServiceStats> {
        self.inner.read().stats.clone()
    }

    /// Total selections handed out across all services.
    pub fn total_requests(&self) -> u64 {
        self.inner.read().total_requests
    }
}
