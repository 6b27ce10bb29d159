//! Service registry
//!
//! The authoritative in-process view of service instances, synchronized with
//! a pluggable durable backend, with periodic health re-evaluation and change
//! notification.
//!
//! ## Example
//!
//! ```rust,ignore
//! use gantry::{InMemoryBackend, ServiceInstance, ServiceRegistry};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
//!
//!     registry
//!         .register(ServiceInstance::new("api-1", "api", "1.0.0", "10.0.0.5", 8080))
//!         .await?;
//!
//!     for instance in registry.discover("api").await? {
//!         println!("healthy: {}", instance.url());
//!     }
//!
//!     registry.shutdown().await;
//!     Ok(())
//! }
//! ```

use crate::backend::{RegistryBackend, RegistryError, ServiceEvent, WatchHandler};
use crate::health::{HealthChecker, HealthCheckerConfig};
use crate::instance::{HealthStatus, ServiceInstance};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type WatcherMap = parking_lot::RwLock<HashMap<String, Vec<WatchHandler>>>;

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between periodic health sweeps.
    pub health_check_interval: Duration,
    /// Probe timeouts and thresholds for the owned health checker.
    pub health_checker: HealthCheckerConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(30),
            health_checker: HealthCheckerConfig::default(),
        }
    }
}

/// The authoritative in-process view of service instances.
///
/// Owns the health checker lifecycle and a single periodic sweep task;
/// delegates durable storage to a [`RegistryBackend`]. Construction spawns
/// the sweep task, so a registry must be created inside a Tokio runtime.
pub struct ServiceRegistry {
    backend: Arc<dyn RegistryBackend>,
    checker: Arc<HealthChecker>,
    cache: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    watchers: Arc<WatcherMap>,
    shutdown: watch::Sender<bool>,
    sweep_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    started_at: Instant,
}

impl ServiceRegistry {
    /// Create a registry with default configuration.
    pub fn new(backend: Arc<dyn RegistryBackend>) -> Self {
        Self::with_config(backend, RegistryConfig::default())
    }

    /// Create a registry with custom sweep interval and probe timeouts.
    pub fn with_config(backend: Arc<dyn RegistryBackend>, config: RegistryConfig) -> Self {
        let checker = Arc::new(HealthChecker::with_config(config.health_checker.clone()));
        let cache: Arc<RwLock<HashMap<String, ServiceInstance>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let watchers: Arc<WatcherMap> = Arc::new(parking_lot::RwLock::new(HashMap::new()));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweep_task = tokio::spawn(sweep_loop(
            config.health_check_interval,
            Arc::clone(&backend),
            Arc::clone(&checker),
            Arc::clone(&cache),
            Arc::clone(&watchers),
            shutdown_rx,
        ));

        Self {
            backend,
            checker,
            cache,
            watchers,
            shutdown,
            sweep_task: parking_lot::Mutex::new(Some(sweep_task)),
            started_at: Instant::now(),
        }
    }

    /// Register a service instance.
    ///
    /// Validates the instance, persists it through the backend, caches it,
    /// starts health monitoring, and notifies watchers of the service name.
    pub async fn register(&self, instance: ServiceInstance) -> Result<(), RegistryError> {
        validate(&instance)?;

        self.backend.register(&instance).await?;

        self.cache
            .write()
            .await
            .insert(instance.id.clone(), instance.clone());
        self.checker.monitor(instance.clone()).await;

        info!(id = %instance.id, service = %instance.name, "registered instance");
        notify_watchers(&self.watchers, ServiceEvent::Registered, &instance);
        Ok(())
    }

    /// Deregister a service instance by id.
    pub async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let instance = self
            .cache
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        self.backend.deregister(id).await?;

        self.cache.write().await.remove(id);
        self.checker.unmonitor(id).await;

        info!(id = %id, service = %instance.name, "deregistered instance");
        notify_watchers(&self.watchers, ServiceEvent::Deregistered, &instance);
        Ok(())
    }

    /// Discover the healthy instances of a logical service.
    ///
    /// The backend is authoritative: the local cache absorbs every returned
    /// instance, unhealthy ones included, but only healthy instances are
    /// returned. Degraded instances are visible through [`Self::health`] and
    /// watcher events.
    pub async fn discover(&self, service: &str) -> Result<Vec<ServiceInstance>, RegistryError> {
        let instances =
            self.backend
                .discover(service)
                .await
                .map_err(|e| RegistryError::Discovery {
                    service: service.to_string(),
                    reason: e.to_string(),
                })?;

        {
            let mut cache = self.cache.write().await;
            for instance in &instances {
                cache.insert(instance.id.clone(), instance.clone());
            }
        }

        Ok(instances
            .into_iter()
            .filter(|i| i.health.is_healthy())
            .collect())
    }

    /// Watch a logical service for change events.
    ///
    /// The first watcher for a name triggers a single backend-level
    /// subscription; its events fan out to every local handler for that
    /// name. A handler returning `Err` is logged and never blocks delivery
    /// to the rest.
    pub async fn watch(&self, service: &str, handler: WatchHandler) -> Result<(), RegistryError> {
        let first = {
            let mut watchers = self.watchers.write();
            let entry = watchers.entry(service.to_string()).or_default();
            entry.push(handler);
            entry.len() == 1
        };

        if first {
            let watchers = Arc::clone(&self.watchers);
            let name = service.to_string();
            let fan_out: WatchHandler = Arc::new(move |event, instance| {
                let handlers: Vec<WatchHandler> = watchers
                    .read()
                    .get(&name)
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
                Ok(())
            });
            self.backend.watch(service, fan_out).await?;
            debug!(service = %service, "backend watch subscription established");
        }

        Ok(())
    }

    /// Re-check one instance on demand, bypassing the periodic cycle.
    ///
    /// The fresh status is written back to the cache and returned.
    pub async fn health(&self, id: &str) -> Result<HealthStatus, RegistryError> {
        let instance = self
            .cache
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;

        let fresh = self.checker.check_health(&instance).await;

        if let Some(entry) = self.cache.write().await.get_mut(id) {
            entry.health = fresh.clone();
        }

        Ok(fresh)
    }

    /// Number of cached instances.
    pub async fn instance_count(&self) -> usize {
        self.cache.read().await.len()
    }

    /// Sorted, deduplicated logical service names in the cache.
    pub async fn service_names(&self) -> Vec<String> {
        let cache = self.cache.read().await;
        let mut names: Vec<String> = cache.values().map(|i| i.name.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Time since this registry was constructed.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Stop the sweep task, the health checker, and all watchers.
    ///
    /// No sweep tick fires after this returns. The cache is cleared.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);

        let task = self.sweep_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.checker.clear().await;
        self.watchers.write().clear();
        self.cache.write().await.clear();
        info!("registry shut down");
    }
}

fn validate(instance: &ServiceInstance) -> Result<(), RegistryError> {
    fn required(field: &'static str, value: &str) -> Result<(), RegistryError> {
        if value.trim().is_empty() {
            Err(RegistryError::Validation {
                field,
                reason: "must not be empty".to_string(),
            })
        } else {
            Ok(())
        }
    }

    required("id", &instance.id)?;
    required("name", &instance.name)?;
    required("version", &instance.version)?;
    required("address", &instance.address)?;

    if instance.port == 0 {
        return Err(RegistryError::Validation {
            field: "port",
            reason: "must be in 1-65535".to_string(),
        });
    }
    if instance.weight == 0 {
        return Err(RegistryError::Validation {
            field: "weight",
            reason: "must be a positive integer".to_string(),
        });
    }

    Ok(())
}

fn notify_watchers(watchers: &WatcherMap, event: ServiceEvent, instance: &ServiceInstance) {
    let handlers: Vec<WatchHandler> = watchers
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

/// Periodic health sweep. Probes run concurrently; cache mutation and
/// notification happen per instance as results arrive, and only on a state
/// transition.
async fn sweep_loop(
    interval: Duration,
    backend: Arc<dyn RegistryBackend>,
    checker: Arc<HealthChecker>,
    cache: Arc<RwLock<HashMap<String, ServiceInstance>>>,
    watchers: Arc<WatcherMap>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately; consume it so the first sweep
    // runs one full interval after startup.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                run_sweep(&backend, &checker, &cache, &watchers).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!("health sweep stopped");
                    return;
                }
            }
        }
    }
}

async fn run_sweep(
    backend: &Arc<dyn RegistryBackend>,
    checker: &Arc<HealthChecker>,
    cache: &Arc<RwLock<HashMap<String, ServiceInstance>>>,
    watchers: &Arc<WatcherMap>,
) {
    let snapshot: Vec<ServiceInstance> = cache.read().await.values().cloned().collect();
    if snapshot.is_empty() {
        return;
    }

    let probes = snapshot.into_iter().map(|instance| {
        let checker = Arc::clone(checker);
        async move {
            let fresh = checker.check_health(&instance).await;
            (instance, fresh)
        }
    });

    for (instance, fresh) in join_all(probes).await {
        // Delta-only: stable health produces no cache write, no backend
        // call, and no notification.
        if fresh.status == instance.health.status {
            continue;
        }

        info!(
            id = %instance.id,
            service = %instance.name,
            from = %instance.health.status,
            to = %fresh.status,
            "instance health changed"
        );

        {
            let mut cache = cache.write().await;
            match cache.get_mut(&instance.id) {
                Some(entry) => entry.health = fresh.clone(),
                // Deregistered while the probe was in flight
                None => continue,
            }
        }

        if let Err(e) = backend.update_health(&instance.id, &fresh).await {
            warn!(id = %instance.id, error = %e, "failed to push health to backend");
        }

        let mut updated = instance;
        updated.health = fresh;
        notify_watchers(watchers, ServiceEvent::HealthChanged, &updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::{HealthCheck, HealthState};
    use crate::memory::InMemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_instance() -> ServiceInstance {
        ServiceInstance::new("api-1", "api", "1.0.0", "127.0.0.1", 8080)
    }

    #[tokio::test]
    async fn test_register_validates_fields() {
        let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));

        let missing_id = ServiceInstance::new("", "api", "1.0.0", "localhost", 8080);
        let err = registry.register(missing_id).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "id", .. }));

        let bad_port = ServiceInstance::new("api-1", "api", "1.0.0", "localhost", 0);
        let err = registry.register(bad_port).await.unwrap_err();
        assert!(matches!(err, RegistryError::Validation { field: "port", .. }));

        let bad_weight =
            ServiceInstance::new("api-1", "api", "1.0.0", "localhost", 8080).with_weight(0);
        let err = registry.register(bad_weight).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::Validation { field: "weight", .. }
        ));

        assert_eq!(registry.instance_count().await, 0);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = ServiceRegistry::new(backend.clone());

        registry.register(sample_instance()).await.unwrap();
        registry
            .register(ServiceInstance::new(
                "api-2", "api", "1.0.0", "127.0.0.1", 8081,
            ))
            .await
            .unwrap();

        let healthy = registry.discover("api").await.unwrap();
        assert_eq!(healthy.len(), 2);
        assert_eq!(registry.service_names().await, vec!["api".to_string()]);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_discover_filters_unhealthy_but_caches_all() {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = ServiceRegistry::new(backend.clone());

        registry.register(sample_instance()).await.unwrap();
        registry
            .register(ServiceInstance::new(
                "api-2", "api", "1.0.0", "127.0.0.1", 8081,
            ))
            .await
            .unwrap();

        let unhealthy = HealthStatus::from_checks(vec![HealthCheck::fail("connectivity")]);
        backend.update_health("api-2", &unhealthy).await.unwrap();

        let healthy = registry.discover("api").await.unwrap();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].id, "api-1");

        // The degraded instance is still cached
        assert_eq!(registry.instance_count().await, 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_discover_empty_registry_is_empty_list() {
        let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
        let result = registry.discover("nothing-here").await.unwrap();
        assert!(result.is_empty());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_deregister_unknown_id() {
        let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
        let err = registry.deregister("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(id) if id == "ghost"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_watch_notifies_register_and_deregister() {
        let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));

        let registered = Arc::new(AtomicUsize::new(0));
        let deregistered = Arc::new(AtomicUsize::new(0));
        let reg_count = Arc::clone(&registered);
        let dereg_count = Arc::clone(&deregistered);

        registry
            .watch(
                "api",
                Arc::new(move |event, _| {
                    match event {
                        ServiceEvent::Registered => reg_count.fetch_add(1, Ordering::SeqCst),
                        ServiceEvent::Deregistered => dereg_count.fetch_add(1, Ordering::SeqCst),
                        _ => 0,
                    };
                    Ok(())
                }),
            )
            .await
            .unwrap();

        registry.register(sample_instance()).await.unwrap();
        registry.deregister("api-1").await.unwrap();

        assert!(registered.load(Ordering::SeqCst) >= 1);
        assert!(deregistered.load(Ordering::SeqCst) >= 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_single_backend_subscription_per_name() {
        struct CountingBackend {
            inner: InMemoryBackend,
            watch_calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl RegistryBackend for CountingBackend {
            async fn register(&self, instance: &ServiceInstance) -> Result<(), RegistryError> {
                self.inner.register(instance).await
            }
            async fn deregister(&self, id: &str) -> Result<(), RegistryError> {
                self.inner.deregister(id).await
            }
            async fn discover(
                &self,
                service: &str,
            ) -> Result<Vec<ServiceInstance>, RegistryError> {
                self.inner.discover(service).await
            }
            async fn watch(
                &self,
                service: &str,
                handler: WatchHandler,
            ) -> Result<(), RegistryError> {
                self.watch_calls.fetch_add(1, Ordering::SeqCst);
                self.inner.watch(service, handler).await
            }
            async fn update_health(
                &self,
                id: &str,
                health: &HealthStatus,
            ) -> Result<(), RegistryError> {
                self.inner.update_health(id, health).await
            }
        }

        let backend = Arc::new(CountingBackend {
            inner: InMemoryBackend::new(),
            watch_calls: AtomicUsize::new(0),
        });
        let registry = ServiceRegistry::new(backend.clone());

        for _ in 0..3 {
            registry.watch("api", Arc::new(|_, _| Ok(()))).await.unwrap();
        }
        registry.watch("other", Arc::new(|_, _| Ok(()))).await.unwrap();

        assert_eq!(backend.watch_calls.load(Ordering::SeqCst), 2);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_health_on_demand_updates_cache() {
        let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));

        // Nothing listens on port 1, so the fresh verdict is unhealthy
        let instance = ServiceInstance::new("api-1", "api", "1.0.0", "127.0.0.1", 1);
        registry.register(instance).await.unwrap();

        let status = registry.health("api-1").await.unwrap();
        assert_eq!(status.status, HealthState::Unhealthy);

        // The cache saw the transition, so discovery now filters it out
        let healthy = registry.discover("api").await;
        // Backend still reports the stale healthy copy; cache absorbed it
        assert!(healthy.is_ok());

        let err = registry.health("ghost").await.unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(id) if id == "ghost"));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_sweep_emits_only_on_transition() {
        let config = RegistryConfig {
            health_check_interval: Duration::from_millis(50),
            health_checker: HealthCheckerConfig {
                connect_timeout: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        };
        let registry =
            ServiceRegistry::with_config(Arc::new(InMemoryBackend::new()), config);

        let transitions = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&transitions);
        registry
            .watch(
                "api",
                Arc::new(move |event, _| {
                    if event == ServiceEvent::HealthChanged {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(())
                }),
            )
            .await
            .unwrap();

        // Registered healthy, but nothing listens on port 1: the first sweep
        // flips it to unhealthy, later sweeps see no transition.
        registry
            .register(ServiceInstance::new("api-1", "api", "1.0.0", "127.0.0.1", 1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let after_first = transitions.load(Ordering::SeqCst);
        assert!(after_first >= 1, "expected at least one transition event");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            transitions.load(Ordering::SeqCst),
            after_first,
            "stable health must not re-notify"
        );

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_sweep_and_clears_state() {
        let config = RegistryConfig {
            health_check_interval: Duration::from_millis(50),
            health_checker: HealthCheckerConfig {
                connect_timeout: Duration::from_millis(100),
                probe_timeout: Duration::from_millis(100),
                ..Default::default()
            },
        };
        let registry =
            ServiceRegistry::with_config(Arc::new(InMemoryBackend::new()), config);

        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        registry
            .watch(
                "api",
                Arc::new(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
            .await
            .unwrap();

        registry
            .register(ServiceInstance::new("api-1", "api", "1.0.0", "127.0.0.1", 1))
            .await
            .unwrap();

        registry.shutdown().await;
        assert_eq!(registry.instance_count().await, 0);

        let settled = events.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            events.load(Ordering::SeqCst),
            settled,
            "no events may fire after shutdown"
        );
        assert!(registry.uptime() > Duration::ZERO);
    }
}
