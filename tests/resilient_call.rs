//! Integration tests for the discover -> select -> execute-with-breaker flow.
//!
//! These exercise the registry, load balancer, and circuit breaker together
//! against the in-memory backend, the way an orchestration layer would.

use gantry::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn instance(id: &str, port: u16) -> ServiceInstance {
    ServiceInstance::new(id, "orders", "1.0.0", "127.0.0.1", port)
}

#[tokio::test]
async fn resilient_call_happy_path() {
    let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
    let balancer = LoadBalancer::new(BalancingAlgorithm::RoundRobin);
    let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("orders"));

    registry.register(instance("orders-1", 9001)).await.unwrap();
    registry.register(instance("orders-2", 9002)).await.unwrap();

    balancer.update_services("orders", registry.discover("orders").await.unwrap());
    let chosen = balancer.select_service("orders").unwrap();
    assert!(chosen.id.starts_with("orders-"));

    let result: Result<&str, CircuitBreakerError<&str>> =
        breaker.execute(|| async { Ok("response") }).await;
    assert_eq!(result.unwrap(), "response");
    balancer.record_success(&chosen.id, 8.0);

    let stats = balancer.stats(&chosen.id).unwrap();
    assert_eq!(stats.requests, 1);
    assert_eq!(stats.active_connections, 0);
    assert_eq!(breaker.metrics().total_successes, 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn breaker_trips_and_recovers_across_calls() {
    let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
    let balancer = LoadBalancer::new(BalancingAlgorithm::RoundRobin);
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new("orders")
            .failure_threshold(2)
            .recovery_timeout(Duration::from_millis(30))
            .half_open_max_calls(1),
    );

    registry.register(instance("orders-1", 9001)).await.unwrap();
    balancer.update_services("orders", registry.discover("orders").await.unwrap());

    // Two failed calls trip the breaker
    for _ in 0..2 {
        let chosen = balancer.select_service("orders").unwrap();
        let result: Result<(), _> = breaker.execute(|| async { Err::<(), _>("refused") }).await;
        assert!(result.is_err());
        balancer.record_failure(&chosen.id);
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    // While open, the operation is never invoked
    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invoked);
    let result: Result<(), CircuitBreakerError<&str>> = breaker
        .execute(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(CircuitBreakerError::Open { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // After the recovery timeout, one successful trial closes it again
    tokio::time::sleep(Duration::from_millis(60)).await;
    let chosen = balancer.select_service("orders").unwrap();
    let result: Result<(), CircuitBreakerError<&str>> =
        breaker.execute(|| async { Ok(()) }).await;
    assert!(result.is_ok());
    balancer.record_success(&chosen.id, 5.0);

    assert_eq!(breaker.state(), CircuitState::Closed);
    assert_eq!(breaker.metrics().failure_count, 0);

    registry.shutdown().await;
}

#[tokio::test]
async fn degraded_instance_drops_out_of_rotation() {
    let backend = Arc::new(InMemoryBackend::new());
    let registry = ServiceRegistry::new(backend.clone());
    let balancer = LoadBalancer::new(BalancingAlgorithm::RoundRobin);

    registry.register(instance("orders-1", 9001)).await.unwrap();
    registry.register(instance("orders-2", 9002)).await.unwrap();

    // The backend learns that orders-2 went down
    let down = HealthStatus::from_checks(vec![HealthCheck::fail("connectivity")]);
    backend.update_health("orders-2", &down).await.unwrap();

    balancer.update_services("orders", registry.discover("orders").await.unwrap());
    for _ in 0..6 {
        assert_eq!(balancer.select_service("orders").unwrap().id, "orders-1");
    }

    // When the last instance degrades too, selection fails loudly
    backend.update_health("orders-1", &down).await.unwrap();
    balancer.update_services("orders", registry.discover("orders").await.unwrap());
    assert!(matches!(
        balancer.select_service("orders"),
        Err(BalancerError::NoHealthyInstances(name)) if name == "orders"
    ));

    registry.shutdown().await;
}

#[tokio::test]
async fn watcher_sees_lifecycle_events() {
    let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));

    let registered = Arc::new(AtomicUsize::new(0));
    let deregistered = Arc::new(AtomicUsize::new(0));

    // A broken handler first, to prove it never blocks the second one
    registry
        .watch("orders", Arc::new(|_, _| Err("handler bug".into())))
        .await
        .unwrap();

    let reg = Arc::clone(&registered);
    let dereg = Arc::clone(&deregistered);
    registry
        .watch(
            "orders",
            Arc::new(move |event, instance| {
                assert_eq!(instance.name, "orders");
                match event {
                    ServiceEvent::Registered => reg.fetch_add(1, Ordering::SeqCst),
                    ServiceEvent::Deregistered => dereg.fetch_add(1, Ordering::SeqCst),
                    _ => 0,
                };
                Ok(())
            }),
        )
        .await
        .unwrap();

    registry.register(instance("orders-1", 9001)).await.unwrap();
    registry.deregister("orders-1").await.unwrap();

    assert!(registered.load(Ordering::SeqCst) >= 1);
    assert!(deregistered.load(Ordering::SeqCst) >= 1);

    registry.shutdown().await;
}

#[tokio::test]
async fn duplicate_registration_is_last_write_wins() {
    let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));

    let events = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&events);
    registry
        .watch(
            "orders",
            Arc::new(move |event, _| {
                if event == ServiceEvent::Registered {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }),
        )
        .await
        .unwrap();

    registry.register(instance("orders-1", 9001)).await.unwrap();
    let first_events = events.load(Ordering::SeqCst);

    let replacement =
        ServiceInstance::new("orders-1", "orders", "2.0.0", "127.0.0.1", 9005).with_weight(2);
    registry.register(replacement).await.unwrap();

    let discovered = registry.discover("orders").await.unwrap();
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].version, "2.0.0");
    assert_eq!(discovered[0].port, 9005);

    // Watchers heard about the second registration too
    assert!(events.load(Ordering::SeqCst) > first_events);

    registry.shutdown().await;
}

#[tokio::test]
async fn ip_hash_pins_a_client_to_one_instance() {
    let registry = ServiceRegistry::new(Arc::new(InMemoryBackend::new()));
    let balancer = LoadBalancer::new(BalancingAlgorithm::IpHash);

    for (id, port) in [("orders-1", 9001), ("orders-2", 9002), ("orders-3", 9003)] {
        registry.register(instance(id, port)).await.unwrap();
    }
    balancer.update_services("orders", registry.discover("orders").await.unwrap());

    let pinned = balancer
        .select_service_with_key("orders", "203.0.113.7")
        .unwrap();
    for _ in 0..10 {
        let again = balancer
            .select_service_with_key("orders", "203.0.113.7")
            .unwrap();
        assert_eq!(again.id, pinned.id);
    }

    registry.shutdown().await;
}
