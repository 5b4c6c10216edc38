//! End-to-end behaviour of composed resilience pipelines

use futures::future::join_all;
use keel_resilience::{
    BulkheadConfig, CancellationToken, CircuitBreakerConfig, CircuitState, ManualClock, Pipeline,
    PipelineConfig, ResilienceError, RetryExecutor, RetryPolicy, Retryable,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error("upstream unavailable")]
    Unavailable,
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl Retryable for AppError {
    fn is_retryable(&self) -> bool {
        matches!(self, AppError::Unavailable)
    }
}

fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        multiplier: 2.0,
        jitter_fraction: 0.0,
    }
}

#[tokio::test]
async fn test_breaker_trip_and_recovery_scenario() {
    let clock = ManualClock::shared();
    let pipeline: Pipeline<AppError> = Pipeline::builder("inventory")
        .circuit_breaker(Some(CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_timeout: Duration::from_secs(1),
            ..CircuitBreakerConfig::default()
        }))
        .retry(None)
        .clock(clock.clone())
        .build()
        .unwrap();
    let breaker = pipeline.circuit_breaker().unwrap().clone();
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<(), _> = pipeline
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Unavailable)
            })
            .await;
        assert!(matches!(result, Err(ResilienceError::Operation(AppError::Unavailable))));
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    clock.advance(Duration::from_millis(500));
    let rejected: Result<(), _> = pipeline
        .execute(&cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { ref dependency, .. }) if dependency == "inventory"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    clock.advance(Duration::from_millis(600));
    pipeline
        .execute(&cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(())
        })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    pipeline
        .execute(&cancel, || async { Ok::<_, AppError>(()) })
        .await
        .unwrap();
    assert_eq!(breaker.state(), CircuitState::Closed);

    let stats = pipeline.stats();
    assert_eq!(stats.calls_total, 6);
    assert_eq!(stats.circuit_rejections_total, 1);
    assert_eq!(stats.circuit.unwrap().trips, 1);
}

#[tokio::test]
async fn test_bulkhead_rejections_never_reach_breaker_or_retry() {
    let pipeline: Pipeline<AppError> = Pipeline::builder("search")
        .bulkhead(Some(BulkheadConfig::semaphore(2)))
        .circuit_breaker(Some(CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }))
        .retry(Some(retry_policy(3)))
        .build()
        .unwrap();
    let cancel = CancellationToken::new();
    let gate = Arc::new(Semaphore::new(0));
    let invocations = Arc::new(AtomicU32::new(0));

    let calls = (0..5).map(|i| {
        let pipeline = pipeline.clone();
        let cancel = cancel.clone();
        let gate = gate.clone();
        let invocations = invocations.clone();
        async move {
            pipeline
                .execute(&cancel, || {
                    let gate = gate.clone();
                    let invocations = invocations.clone();
                    async move {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        gate.acquire().await.unwrap().forget();
                        Ok::<_, AppError>(i)
                    }
                })
                .await
        }
    });

    let release = async {
        while pipeline.stats().bulkhead_rejections_total < 3 {
            tokio::task::yield_now().await;
        }
        assert_eq!(pipeline.stats().in_flight(), 2);
        gate.add_permits(2);
    };

    let (results, ()) = tokio::join!(join_all(calls), release);

    let admitted = results.iter().filter(|r| r.is_ok()).count();
    let rejected = results
        .iter()
        .filter(|r| matches!(r, Err(ResilienceError::BulkheadRejected { capacity: 2, .. })))
        .count();
    assert_eq!(admitted, 2);
    assert_eq!(rejected, 3);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let stats = pipeline.stats();
    assert_eq!(stats.retries_total, 0);
    assert_eq!(stats.circuit.as_ref().unwrap().state, CircuitState::Closed);
    assert_eq!(stats.circuit.as_ref().unwrap().total_failures, 0);
    assert_eq!(stats.in_flight(), 0);

    // No permanent lockout
    let again = pipeline
        .execute(&cancel, || async { Ok::<_, AppError>(99) })
        .await;
    assert_eq!(again.unwrap(), 99);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_absorbed_with_backoff() {
    let pipeline: Pipeline<AppError> = Pipeline::new(
        "profile",
        PipelineConfig {
            retry: Some(retry_policy(3)),
            ..PipelineConfig::default()
        },
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let attempts = AtomicU32::new(0);
    let started = tokio::time::Instant::now();

    let value = pipeline
        .execute(&cancel, || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(AppError::Unavailable)
            } else {
                Ok("profile")
            }
        })
        .await
        .unwrap();

    assert_eq!(value, "profile");
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(300), "{:?}", elapsed);
    assert!(elapsed < Duration::from_millis(310), "{:?}", elapsed);

    let stats = pipeline.stats();
    assert_eq!(stats.retries_total, 2);
    assert_eq!(stats.successes_total, 1);
    assert_eq!(stats.circuit.unwrap().total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_during_backoff() {
    let pipeline: Pipeline<AppError> = Pipeline::new(
        "profile",
        PipelineConfig {
            retry: Some(RetryPolicy {
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(30),
                ..retry_policy(5)
            }),
            ..PipelineConfig::default()
        },
    )
    .unwrap();
    let cancel = CancellationToken::new();
    let attempts = AtomicU32::new(0);

    let canceller = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        }
    };
    let call = pipeline.execute(&cancel, || async {
        attempts.fetch_add(1, Ordering::SeqCst);
        Err::<(), _>(AppError::Unavailable)
    });

    let (result, ()) = tokio::join!(call, canceller);

    assert!(matches!(result, Err(ResilienceError::Cancelled)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let stats = pipeline.stats();
    assert_eq!(stats.cancellations_total, 1);
    let circuit = stats.circuit.unwrap();
    assert_eq!(circuit.total_failures, 0);
    assert_eq!(circuit.total_ignored, 1);
}

#[tokio::test]
async fn test_outer_retry_stops_at_open_circuit() {
    let pipeline: Pipeline<AppError> = Pipeline::new(
        "billing",
        PipelineConfig {
            circuit_breaker: Some(CircuitBreakerConfig {
                failure_threshold: 1,
                ..CircuitBreakerConfig::default()
            }),
            retry: None,
            ..PipelineConfig::default()
        },
    )
    .unwrap();
    let outer: RetryExecutor<ResilienceError<AppError>> = RetryExecutor::new(RetryPolicy {
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        ..retry_policy(5)
    })
    .unwrap();
    let cancel = CancellationToken::new();
    let invocations = AtomicU32::new(0);

    let result: Result<(), _> = outer
        .execute(&cancel, || {
            pipeline.execute(&cancel, || async {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Unavailable)
            })
        })
        .await;

    // First attempt trips the breaker, second is rejected and not retried
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    match result {
        Err(ResilienceError::Operation(inner)) => assert!(inner.is_circuit_open()),
        other => panic!("expected circuit-open rejection, got {:?}", other),
    }
    assert_eq!(outer.retries_total(), 1);
}

#[tokio::test]
async fn test_business_errors_pass_through_untouched() {
    let pipeline: Pipeline<AppError> = Pipeline::new("orders", PipelineConfig::default()).unwrap();
    let cancel = CancellationToken::new();

    let result: Result<(), _> = pipeline
        .execute(&cancel, || async {
            Err(AppError::Invalid("missing sku".to_string()))
        })
        .await;

    match result {
        Err(ResilienceError::Operation(AppError::Invalid(message))) => {
            assert_eq!(message, "missing sku")
        }
        other => panic!("unexpected result {:?}", other),
    }

    let json = serde_json::to_value(pipeline.stats()).unwrap();
    assert_eq!(json["name"], "orders");
    assert_eq!(json["circuit"]["state"], "closed");
    assert_eq!(json["circuit"]["total_ignored"], 1);
    assert_eq!(json["failures_total"], 1);
}
