use super::*;
use crate::error::Error;
use crate::event_bus::{EventBus, MemoryBroker};
use futures::FutureExt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn started(config: RetryManagerConfig) -> Arc<RetryManager> {
    let manager = Arc::new(RetryManager::new(config));
    manager.start(CancellationToken::new());
    manager
}

fn fast_config() -> RetryManagerConfig {
    RetryManagerConfig::default().with_poll_interval(Duration::from_millis(50))
}

/// Fails with `err` for the first `failures` calls, then returns the call number.
fn flaky(calls: Arc<AtomicU32>, failures: u32, err: Error) -> RetryOperation {
    Arc::new(move || {
        let calls = Arc::clone(&calls);
        let err = err.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= failures {
                Err(err)
            } else {
                Ok(serde_json::json!(n))
            }
        }
        .boxed()
    })
}

fn no_jitter(attempts: u32) -> RetryConfig {
    RetryConfig::new()
        .with_max_attempts(attempts)
        .with_initial_delay(Duration::from_millis(100))
        .with_jitter(false)
}

#[test]
fn test_retry_config_defaults() {
    let config = RetryConfig::default();
    assert_eq!(config.max_attempts, 3);
    assert_eq!(config.initial_delay, Duration::from_secs(1));
    assert_eq!(config.max_delay, Duration::from_secs(300));
    assert_eq!(config.backoff_multiplier, 2.0);
    assert_eq!(config.strategy, RetryStrategy::ExponentialBackoff);
    assert!(config.jitter);
}

#[test]
fn test_retry_config_builder_and_presets() {
    let config = RetryConfig::new()
        .with_max_attempts(5)
        .with_initial_delay(Duration::from_millis(200))
        .with_max_delay(Duration::from_secs(30))
        .with_backoff_multiplier(3.0)
        .with_strategy(RetryStrategy::LinearBackoff)
        .with_jitter(false);
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.strategy, RetryStrategy::LinearBackoff);
    assert!(!config.jitter);

    let step = RetryConfig::pipeline_step();
    assert_eq!(step.max_attempts, 5);
    assert_eq!(step.initial_delay, Duration::from_secs(2));
    assert_eq!(step.max_delay, Duration::from_secs(120));

    let api = RetryConfig::api_call();
    assert_eq!(api.max_attempts, 3);
    assert_eq!(api.initial_delay, Duration::from_millis(500));
    assert_eq!(api.max_delay, Duration::from_secs(30));
}

#[test]
fn test_strategy_delays() {
    let base = RetryConfig::new()
        .with_initial_delay(Duration::from_secs(1))
        .with_jitter(false);

    let immediate = base.clone().with_strategy(RetryStrategy::Immediate);
    assert_eq!(immediate.base_delay(3), Duration::ZERO);

    let fixed = base.clone().with_strategy(RetryStrategy::FixedDelay);
    assert_eq!(fixed.base_delay(0), Duration::from_secs(1));
    assert_eq!(fixed.base_delay(4), Duration::from_secs(1));

    let linear = base.clone().with_strategy(RetryStrategy::LinearBackoff);
    assert_eq!(linear.base_delay(0), Duration::from_secs(1));
    assert_eq!(linear.base_delay(2), Duration::from_secs(3));

    let exponential = base.with_strategy(RetryStrategy::ExponentialBackoff);
    assert_eq!(exponential.base_delay(0), Duration::from_secs(1));
    assert_eq!(exponential.base_delay(1), Duration::from_secs(2));
    assert_eq!(exponential.base_delay(3), Duration::from_secs(8));
}

#[test]
fn test_exponential_delays_never_decrease_and_respect_max() {
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_millis(500))
        .with_max_delay(Duration::from_secs(20))
        .with_jitter(false);

    let delays: Vec<Duration> = (0..40).map(|n| config.base_delay(n)).collect();
    for pair in delays.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
    assert_eq!(*delays.last().unwrap(), Duration::from_secs(20));

    let shrinking = config.with_backoff_multiplier(0.5);
    assert!(shrinking.base_delay(5) >= shrinking.base_delay(4));
}

#[test]
fn test_jitter_stays_within_half_to_one_and_a_half() {
    let config = RetryConfig::new()
        .with_strategy(RetryStrategy::FixedDelay)
        .with_initial_delay(Duration::from_secs(10));
    for _ in 0..200 {
        let delay = config.delay_for(0);
        assert!(delay >= Duration::from_secs(5));
        assert!(delay < Duration::from_secs(15));
    }
}

#[tokio::test(start_paused = true)]
async fn test_success_on_first_attempt() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    manager
        .submit_task("t1", flaky(calls.clone(), 0, Error::transient("x", "y")), no_jitter(3))
        .unwrap();
    let value = manager
        .wait_for_task("t1", Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(value, serde_json::json!(1));
    let status = manager.get_task_status("t1").unwrap();
    assert!(status.completed);
    assert_eq!(status.result, Some(TaskResult::Success));
    assert_eq!(status.attempts, 1);

    let metrics = manager.get_metrics();
    assert_eq!(metrics.total_tasks, 1);
    assert_eq!(metrics.successful_tasks, 1);
    assert_eq!(metrics.retry_attempts, 1);
    assert_eq!(metrics.active_tasks, 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    manager
        .submit_task(
            "flaky",
            flaky(calls.clone(), 2, Error::transient("captions", "503")),
            no_jitter(3),
        )
        .unwrap();
    let value = manager
        .wait_for_task("flaky", Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(value, serde_json::json!(3));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let metrics = manager.get_metrics();
    assert_eq!(metrics.retry_attempts, 3);
    assert!((metrics.avg_attempts_per_task - 3.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn test_never_exceeds_max_attempts() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    manager
        .submit_task(
            "doomed",
            flaky(calls.clone(), u32::MAX, Error::transient("publisher", "timeout")),
            no_jitter(4),
        )
        .unwrap();
    let err = manager
        .wait_for_task("doomed", Duration::from_secs(60))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::TransientService { .. }));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    let status = manager.get_task_status("doomed").unwrap();
    assert_eq!(status.attempts, 4);
    assert_eq!(status.result, Some(TaskResult::Failed));
    assert!(status.last_error.unwrap().contains("timeout"));
    assert_eq!(manager.get_metrics().failed_tasks, 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_error_terminates_immediately() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    manager
        .submit_task(
            "rejected",
            flaky(calls.clone(), u32::MAX, Error::permanent("publisher", "403")),
            no_jitter(5),
        )
        .unwrap();
    let err = manager
        .wait_for_task("rejected", Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::PermanentService { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_observed_exponential_gaps_grow() {
    let manager = started(
        RetryManagerConfig::default().with_poll_interval(Duration::from_millis(10)),
    );
    let stamps = Arc::new(Mutex::new(Vec::new()));

    let recorder = Arc::clone(&stamps);
    let op: RetryOperation = Arc::new(move || {
        recorder.lock().unwrap().push(Instant::now());
        async { Err(Error::transient("analytics", "502")) }.boxed()
    });
    let config = RetryConfig::new()
        .with_max_attempts(4)
        .with_initial_delay(Duration::from_secs(1))
        .with_jitter(false);

    manager.submit_task("gaps", op, config.clone()).unwrap();
    let _ = manager.wait_for_task("gaps", Duration::from_secs(60)).await;

    let stamps = stamps.lock().unwrap().clone();
    assert_eq!(stamps.len(), 4);
    let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
    for (n, gap) in gaps.iter().enumerate() {
        assert!(*gap >= config.base_delay(n as u32));
    }
    for pair in gaps.windows(2) {
        assert!(pair[1] >= pair[0]);
    }
}

#[tokio::test(start_paused = true)]
async fn test_cancel_task() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_secs(600))
        .with_jitter(false);

    manager
        .submit_task(
            "cancel-me",
            flaky(calls.clone(), u32::MAX, Error::transient("x", "down")),
            config,
        )
        .unwrap();
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(manager.cancel_task("cancel-me"));
    assert!(!manager.cancel_task("cancel-me"));

    let err = manager
        .wait_for_task("cancel-me", Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled(_)));
    assert_eq!(
        manager.get_task_status("cancel-me").unwrap().result,
        Some(TaskResult::Cancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn test_force_retry_skips_backoff() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new()
        .with_initial_delay(Duration::from_secs(3600))
        .with_max_delay(Duration::from_secs(3600))
        .with_jitter(false);

    manager
        .submit_task(
            "forced",
            flaky(calls.clone(), 1, Error::transient("x", "blip")),
            config,
        )
        .unwrap();
    while calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;

    let status = manager.get_task_status("forced").unwrap();
    assert!(!status.completed);
    assert!(status.next_retry_in.unwrap() > 3000.0);

    assert!(manager.force_retry("forced"));
    let value = manager
        .wait_for_task("forced", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(value, serde_json::json!(2));
    assert!(!manager.force_retry("forced"));
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_unknown_and_timeout() {
    let manager = started(fast_config());
    assert!(matches!(
        manager.wait_for_task("nope", Duration::from_secs(1)).await,
        Err(Error::NotFound(_))
    ));

    let never: RetryOperation = Arc::new(|| {
        async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(serde_json::Value::Null)
        }
        .boxed()
    });
    manager.submit_task("slow", never, no_jitter(1)).unwrap();
    assert!(matches!(
        manager.wait_for_task("slow", Duration::from_secs(2)).await,
        Err(Error::Timeout(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_active_task_rejected() {
    let manager = RetryManager::new(fast_config());
    let calls = Arc::new(AtomicU32::new(0));
    manager
        .submit_task("dup", flaky(calls.clone(), 0, Error::transient("x", "y")), no_jitter(1))
        .unwrap();
    assert!(manager
        .submit_task("dup", flaky(calls, 0, Error::transient("x", "y")), no_jitter(1))
        .is_err());
}

#[tokio::test(start_paused = true)]
async fn test_completed_history_is_bounded() {
    let manager = started(fast_config().with_completed_history(2));
    for id in ["a", "b", "c"] {
        let calls = Arc::new(AtomicU32::new(0));
        manager
            .submit_task(id, flaky(calls, 0, Error::transient("x", "y")), no_jitter(1))
            .unwrap();
        manager
            .wait_for_task(id, Duration::from_secs(5))
            .await
            .unwrap();
    }
    assert!(manager.get_task_status("a").is_none());
    assert!(manager.get_task_status("b").is_some());
    assert!(manager.get_task_status("c").is_some());
}

#[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Caption {
    text: String,
}

#[tokio::test(start_paused = true)]
async fn test_retry_pipeline_step_is_typed() {
    let manager = started(fast_config());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let caption: Caption = manager
        .retry_pipeline_step("task-1", "caption", move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::transient("captions", "overloaded"))
                } else {
                    Ok(Caption {
                        text: "hello".to_string(),
                    })
                }
            }
        })
        .await
        .unwrap();

    assert_eq!(caption.text, "hello");
    let status = manager.get_task_status("task-1_caption").unwrap();
    assert_eq!(status.attempts, 2);
    assert_eq!(status.max_attempts, 5);
}

#[tokio::test(start_paused = true)]
async fn test_retry_api_call_uses_api_policy() {
    let manager = started(fast_config());
    let value: u32 = manager
        .retry_api_call("job", || async { Ok::<u32, Error>(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);
    assert_eq!(
        manager.get_task_status("job_api_call").unwrap().max_attempts,
        3
    );
}

#[tokio::test]
async fn test_events_published_to_bus() {
    let bus = Arc::new(EventBus::new(Arc::new(MemoryBroker::new(64))));
    bus.start_listening(CancellationToken::new()).await.unwrap();
    let (_, mut rx) = bus.subscribe_channel(crate::event_bus::WILDCARD_CHANNEL);

    let manager = Arc::new(
        RetryManager::new(RetryManagerConfig::default().with_poll_interval(Duration::from_millis(10)))
            .with_event_bus(Arc::clone(&bus)),
    );
    manager.start(CancellationToken::new());

    let calls = Arc::new(AtomicU32::new(0));
    let config = RetryConfig::new()
        .with_strategy(RetryStrategy::Immediate)
        .with_max_attempts(2);
    manager
        .submit_task("evt", flaky(calls, 1, Error::transient("x", "y")), config)
        .unwrap();
    manager
        .wait_for_task("evt", Duration::from_secs(5))
        .await
        .unwrap();

    let mut seen = Vec::new();
    while seen.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        seen.push(event.event_type);
    }
    assert_eq!(seen, vec!["retry.retry_scheduled", "retry.task_completed"]);
}
