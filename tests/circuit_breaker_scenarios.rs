//! Circuit breaker state machine scenarios.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilience_engine::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerSpec, CircuitState,
};
use resilience_engine::resilience::fallback::Fallback;
use resilience_engine::resilience::retries::RetrySpec;
use resilience_engine::resilience::window::SlidingWindowType;
use resilience_engine::{
    CallNotPermitted, ErrorKind, EventCategory, EventKind, ResilienceError, ResilienceRegistry,
    ResilienceResult,
};

mod common;
use common::{Downstream, Programmable, Recorder};

fn five_call_breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        CircuitBreakerSpec::builder("customCircuitBreaker")
            .sliding_window(SlidingWindowType::CountBased, 5)
            .minimum_number_of_calls(5)
            .failure_rate_threshold(50.0)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .permitted_number_of_calls_in_half_open_state(3)
            .build()
            .unwrap(),
    )
}

async fn call(cb: &CircuitBreaker, ok: bool) -> ResilienceResult<(), Downstream> {
    cb.execute((), |_: &()| async move {
        if ok {
            Ok(())
        } else {
            Err(Downstream::Status(500))
        }
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn test_three_failures_in_five_calls_opens() {
    let cb = five_call_breaker();

    for ok in [false, true, false, true] {
        let _ = call(&cb, ok).await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
    let _ = call(&cb, false).await;

    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_two_failures_in_five_calls_stays_closed() {
    let cb = five_call_breaker();

    for ok in [false, true, true, false, true] {
        let _ = call(&cb, ok).await;
    }

    assert_eq!(cb.state(), CircuitState::Closed);
    let metrics = cb.metrics();
    assert_eq!(metrics.buffered_calls, 5);
    assert_eq!(metrics.failed_calls, 2);
    assert_eq!(metrics.failure_rate, Some(40.0));
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_rejects_without_invoking_operation() {
    let cb = five_call_breaker();
    let recorder = Recorder::default();
    cb.events().subscribe_all(recorder.handler());

    for _ in 0..5 {
        let _ = call(&cb, false).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let invoked = AtomicU32::new(0);
    let err = cb
        .execute((), |_: &()| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Downstream>(()) }
        })
        .await
        .unwrap_err();

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(err.kind(), ErrorKind::CallNotPermitted);
    assert_eq!(cb.not_permitted_calls(), 1);
    assert_eq!(
        recorder.categories().last(),
        Some(&EventCategory::CallNotPermitted)
    );
}

#[tokio::test(start_paused = true)]
async fn test_rejected_operation_is_never_polled() {
    let cb = five_call_breaker();
    cb.transition_to(CircuitState::ForcedOpen).unwrap();
    let svc = Programmable::new(|_| Ok("ok".to_string()));

    let err = cb
        .execute((), |_: &()| {
            let svc = svc.clone();
            async move { svc.call().await }
        })
        .await
        .unwrap_err();

    assert!(err.is_call_not_permitted());
    assert_eq!(svc.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_half_open_quota_does_not_invoke_operation() {
    let cb = five_call_breaker();
    cb.transition_to(CircuitState::HalfOpen).unwrap();
    let held: Vec<_> = (0..3).map(|_| cb.try_acquire_permission().unwrap()).collect();

    let invoked = AtomicU32::new(0);
    let err = cb
        .execute((), |_: &()| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Downstream>(()) }
        })
        .await
        .unwrap_err();

    assert!(err.is_call_not_permitted());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(cb.metrics().half_open_trials_admitted, 3);
    drop(held);
}

#[tokio::test(start_paused = true)]
async fn test_registry_does_not_invoke_operation_behind_open_breaker() {
    let registry = ResilienceRegistry::default();
    registry
        .register_retry(RetrySpec::builder("movies").build().unwrap(), false)
        .unwrap();
    registry
        .register_circuit_breaker(
            CircuitBreakerSpec::builder("movies").build().unwrap(),
            false,
        )
        .unwrap();
    registry
        .transition_state("movies", CircuitState::Open, None)
        .unwrap();

    let invoked = AtomicU32::new(0);
    let err = registry
        .execute("movies", (), |_: &()| {
            invoked.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, Downstream>(()) }
        })
        .await
        .unwrap_err();

    assert!(err.is_call_not_permitted());
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_outcome_is_published_before_the_transition_it_causes() {
    let cb = five_call_breaker();
    let recorder = Recorder::default();
    cb.events().subscribe_all(recorder.handler());

    for _ in 0..5 {
        let _ = call(&cb, false).await;
    }

    let categories = recorder.categories();
    assert_eq!(
        &categories[categories.len() - 2..],
        &[EventCategory::Error, EventCategory::StateTransition]
    );
}

#[tokio::test(start_paused = true)]
async fn test_half_open_admits_permitted_number_of_trials() {
    let cb = five_call_breaker();
    cb.transition_to(CircuitState::HalfOpen).unwrap();

    let first = cb.try_acquire_permission().unwrap();
    let second = cb.try_acquire_permission().unwrap();
    let third = cb.try_acquire_permission().unwrap();
    assert_eq!(third.state(), CircuitState::HalfOpen);

    let rejected = cb.try_acquire_permission().err().unwrap();
    assert_eq!(
        rejected,
        CallNotPermitted {
            name: "customCircuitBreaker".to_string(),
            state: CircuitState::HalfOpen,
        }
    );

    // a dropped permit gives its slot back
    drop(first);
    let replacement = cb.try_acquire_permission().unwrap();

    second.on_success();
    third.on_success();
    replacement.on_success();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_half_open_trials_are_bounded() {
    let cb = Arc::new(five_call_breaker());
    cb.transition_to(CircuitState::HalfOpen).unwrap();
    let in_flight = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let cb = cb.clone();
        let in_flight = in_flight.clone();
        handles.push(tokio::spawn(async move {
            cb.execute((), |_: &()| {
                let in_flight = in_flight.clone();
                async move {
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, Downstream>(())
                }
            })
            .await
        }));
    }

    let mut rejected = 0;
    for handle in handles {
        if handle.await.unwrap().is_err() {
            rejected += 1;
        }
    }

    assert_eq!(in_flight.load(Ordering::SeqCst), 3);
    assert_eq!(rejected, 7);
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_open_moves_to_half_open_after_wait() {
    let cb = five_call_breaker();
    let recorder = Recorder::default();
    cb.subscribe(EventCategory::StateTransition, recorder.handler());

    for _ in 0..5 {
        let _ = call(&cb, false).await;
    }
    tokio::time::advance(Duration::from_millis(4999)).await;
    assert_eq!(cb.state(), CircuitState::Open);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);

    // trial failures reopen the breaker
    for _ in 0..3 {
        let _ = call(&cb, false).await;
    }
    assert_eq!(cb.state(), CircuitState::Open);

    let transitions: Vec<_> = recorder
        .events()
        .into_iter()
        .map(|e| match e.kind {
            EventKind::StateTransition { from, to } => (from, to),
            other => panic!("unexpected event {other:?}"),
        })
        .collect();
    assert_eq!(
        transitions,
        vec![
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Open),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_open_without_auto_transition_stays_open() {
    let cb = CircuitBreaker::new(
        CircuitBreakerSpec::builder("manual")
            .wait_duration_in_open_state(Duration::from_secs(1))
            .automatic_transition_from_open_to_half_open_enabled(false)
            .build()
            .unwrap(),
    );

    cb.transition_to(CircuitState::Open).unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(cb.state(), CircuitState::Open);

    cb.transition_to_open_for(Duration::from_secs(2)).unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cb.state(), CircuitState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn test_slow_calls_trip_the_breaker() {
    let cb = CircuitBreaker::new(
        CircuitBreakerSpec::builder("slow")
            .sliding_window(SlidingWindowType::CountBased, 4)
            .minimum_number_of_calls(4)
            .slow_call_duration_threshold(Duration::from_secs(1))
            .slow_call_rate_threshold(50.0)
            .build()
            .unwrap(),
    );

    for delay_ms in [10, 2000, 10, 2000] {
        let _ = cb
            .execute((), |_: &()| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok::<_, Downstream>(())
            })
            .await;
    }

    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_time_window_forgets_old_failures() {
    let cb = CircuitBreaker::new(
        CircuitBreakerSpec::builder("timed")
            .sliding_window(SlidingWindowType::TimeBased, 10)
            .minimum_number_of_calls(2)
            .build()
            .unwrap(),
    );

    let _ = call(&cb, false).await;
    tokio::time::advance(Duration::from_secs(11)).await;
    let _ = call(&cb, false).await;
    assert_eq!(cb.state(), CircuitState::Closed);
    assert_eq!(cb.metrics().buffered_calls, 1);

    let _ = call(&cb, false).await;
    assert_eq!(cb.state(), CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_outcome_from_earlier_state_is_discarded() {
    let cb = five_call_breaker();

    let permit = cb.try_acquire_permission().unwrap();
    cb.transition_to(CircuitState::MetricsOnly).unwrap();
    permit.on_failure("late failure".to_string());

    assert_eq!(cb.metrics().buffered_calls, 0);
}

#[tokio::test(start_paused = true)]
async fn test_special_states() {
    let cb = five_call_breaker();

    cb.transition_to(CircuitState::Disabled).unwrap();
    for _ in 0..10 {
        assert!(call(&cb, false).await.is_err());
    }
    assert_eq!(cb.state(), CircuitState::Disabled);
    assert_eq!(cb.metrics().buffered_calls, 0);

    cb.transition_to(CircuitState::MetricsOnly).unwrap();
    for _ in 0..10 {
        let _ = call(&cb, false).await;
    }
    assert_eq!(cb.state(), CircuitState::MetricsOnly);
    assert_eq!(cb.metrics().failed_calls, 5);

    cb.transition_to(CircuitState::ForcedOpen).unwrap();
    tokio::time::advance(Duration::from_secs(3600)).await;
    assert!(call(&cb, true).await.unwrap_err().is_call_not_permitted());
    assert_eq!(cb.state(), CircuitState::ForcedOpen);

    assert!(cb.transition_to(CircuitState::ForcedOpen).is_err());
    cb.reset();
    assert_eq!(cb.state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_fallback_receives_rejection() {
    let cb = CircuitBreaker::new(
        CircuitBreakerSpec::builder("guarded")
            .fallback(Fallback::on_error(|id: &String, err: &CallNotPermitted| {
                format!("cached {id} ({})", err.state)
            }))
            .build()
            .unwrap(),
    );
    cb.transition_to(CircuitState::ForcedOpen).unwrap();

    let value = cb
        .execute("tt1".to_string(), |_: &String| async {
            Ok::<_, Downstream>("live".to_string())
        })
        .await
        .unwrap();

    assert_eq!(value, "cached tt1 (FORCED_OPEN)");
}

#[tokio::test(start_paused = true)]
async fn test_retry_stops_when_inner_breaker_opens() {
    let registry = ResilienceRegistry::default();
    registry
        .register_retry(
            RetrySpec::builder("movies")
                .max_attempts(5)
                .wait_duration(Duration::from_millis(10))
                .build()
                .unwrap(),
            false,
        )
        .unwrap();
    registry
        .register_circuit_breaker(
            CircuitBreakerSpec::builder("movies")
                .sliding_window(SlidingWindowType::CountBased, 3)
                .minimum_number_of_calls(3)
                .build()
                .unwrap(),
            false,
        )
        .unwrap();
    let svc = Programmable::new(|_| Err(Downstream::Reset));

    let err = registry
        .execute("movies", (), |_: &()| {
            let svc = svc.clone();
            async move { svc.call().await }
        })
        .await
        .unwrap_err();

    assert_eq!(svc.calls(), 3);
    assert!(matches!(err, ResilienceError::CallNotPermitted(_)));
    assert_eq!(
        registry.find_circuit_breaker("movies").unwrap().state(),
        CircuitState::Open
    );
}
