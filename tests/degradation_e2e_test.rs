//! Degradation manager driven by a real pipeline's circuit breaker

use keel_resilience::{
    health_check_fn, CancellationToken, CircuitBreakerConfig, CircuitBreakerHealthCheck,
    CircuitState, DegradationManager, FeatureConfig, FeatureRegistration, HealthCheckError,
    HealthLevel, ManualClock, Pipeline, ResilienceError, Retryable,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
#[error("recommendation model unavailable")]
struct ModelError;

impl Retryable for ModelError {
    fn is_retryable(&self) -> bool {
        true
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    pipeline: Pipeline<ModelError>,
    manager: DegradationManager,
    model_up: Arc<AtomicBool>,
    model_calls: Arc<AtomicU32>,
}

impl Harness {
    fn new() -> Self {
        keel_logging::init_simple_tracing("debug").unwrap();

        let clock = ManualClock::shared();
        let pipeline: Pipeline<ModelError> = Pipeline::builder("model-server")
            .circuit_breaker(Some(CircuitBreakerConfig {
                failure_threshold: 2,
                success_threshold: 1,
                open_timeout: Duration::from_secs(30),
                ..CircuitBreakerConfig::default()
            }))
            .retry(None)
            .clock(clock.clone())
            .build()
            .unwrap();

        let manager = DegradationManager::with_clock(clock.clone());
        let breaker = pipeline.circuit_breaker().unwrap().clone();
        manager
            .register(
                FeatureRegistration::new("recommendations")
                    .health_check(Arc::new(CircuitBreakerHealthCheck::new(breaker)))
                    .fallback_value(vec!["bestsellers".to_string()]),
            )
            .unwrap();

        Self {
            clock,
            pipeline,
            manager,
            model_up: Arc::new(AtomicBool::new(true)),
            model_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    async fn recommend(&self) -> Vec<String> {
        let cancel = CancellationToken::new();
        self.manager
            .execute_with_fallback(
                &cancel,
                "recommendations",
                || {
                    self.pipeline.execute(&cancel, || async {
                        self.model_calls.fetch_add(1, Ordering::SeqCst);
                        if self.model_up.load(Ordering::SeqCst) {
                            Ok(vec!["personalized".to_string()])
                        } else {
                            Err(ModelError)
                        }
                    })
                },
                || async {
                    Ok::<_, ResilienceError<ModelError>>(vec!["recently-viewed".to_string()])
                },
            )
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_open_breaker_routes_to_fallback_until_recovery() {
    let harness = Harness::new();

    assert_eq!(harness.recommend().await, vec!["personalized".to_string()]);

    harness.model_up.store(false, Ordering::SeqCst);
    // Each failing primary call falls through to the fallback in the same call
    for _ in 0..2 {
        assert_eq!(harness.recommend().await, vec!["recently-viewed".to_string()]);
    }
    let breaker = harness.pipeline.circuit_breaker().unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Breaker open: primary is skipped entirely
    let calls_before = harness.model_calls.load(Ordering::SeqCst);
    assert_eq!(harness.recommend().await, vec!["recently-viewed".to_string()]);
    assert_eq!(harness.model_calls.load(Ordering::SeqCst), calls_before);
    assert_eq!(
        harness.manager.health_snapshot()["recommendations"],
        HealthLevel::Minimal
    );

    // After the open timeout the primary path carries the breaker probe
    harness.model_up.store(true, Ordering::SeqCst);
    harness.clock.advance(Duration::from_secs(30));
    assert_eq!(harness.recommend().await, vec!["personalized".to_string()]);
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = harness.manager.feature_stats("recommendations").unwrap();
    assert_eq!(stats.primary_successes, 2);
    assert_eq!(stats.primary_failures, 2);
    assert_eq!(stats.fallback_successes, 3);
    assert_eq!(stats.defaults_served, 0);
}

#[tokio::test]
async fn test_operator_override_serves_static_default() {
    let harness = Harness::new();
    harness
        .manager
        .force_level("recommendations", HealthLevel::Unavailable)
        .unwrap();

    assert_eq!(harness.recommend().await, vec!["bestsellers".to_string()]);
    assert_eq!(harness.model_calls.load(Ordering::SeqCst), 0);

    let stats = harness.manager.feature_stats("recommendations").unwrap();
    assert_eq!(stats.forced, Some(HealthLevel::Unavailable));
    assert_eq!(stats.unavailable_skips, 1);

    harness.manager.clear_override("recommendations").unwrap();
    assert_eq!(harness.recommend().await, vec!["personalized".to_string()]);
}

#[tokio::test]
async fn test_independent_probe_and_demotion_ttl() {
    let clock = ManualClock::shared();
    let manager = DegradationManager::with_clock(clock.clone());
    let index_ready = Arc::new(AtomicBool::new(false));
    let probe_flag = index_ready.clone();

    manager
        .register(
            FeatureRegistration::new("search-suggestions")
                .health_check(health_check_fn(move || {
                    let ready = probe_flag.load(Ordering::SeqCst);
                    async move { Ok::<_, HealthCheckError>(ready) }
                }))
                .fallback_value(Vec::<String>::new()),
        )
        .unwrap();
    manager
        .register(
            FeatureRegistration::new("pricing-banner")
                .config(FeatureConfig {
                    demotion_ttl: Duration::from_secs(10),
                    ..FeatureConfig::default()
                })
                .fallback_value(String::new()),
        )
        .unwrap();
    let cancel = CancellationToken::new();

    let suggestions: Vec<String> = manager
        .execute_or_default(&cancel, "search-suggestions", || async {
            Ok::<_, String>(vec!["rust".to_string()])
        })
        .await
        .unwrap();
    assert!(suggestions.is_empty());

    index_ready.store(true, Ordering::SeqCst);
    let suggestions: Vec<String> = manager
        .execute_or_default(&cancel, "search-suggestions", || async {
            Ok::<_, String>(vec!["rust".to_string()])
        })
        .await
        .unwrap();
    assert_eq!(suggestions, vec!["rust".to_string()]);

    let banner = manager
        .execute_or_default(&cancel, "pricing-banner", || async {
            Err::<String, _>("pricing service timeout")
        })
        .await
        .unwrap();
    assert_eq!(banner, "");
    assert_eq!(manager.health_snapshot()["pricing-banner"], HealthLevel::Degraded);

    clock.advance(Duration::from_secs(10));
    assert_eq!(manager.health_snapshot()["pricing-banner"], HealthLevel::Full);
}
