use super::*;
use crate::error::Error;
use crate::event_bus::{Event, EventBus, EventPayload, MemoryBroker, WILDCARD_CHANNEL};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Step {
    Up,
    Down,
    Hang,
    Slow(Duration),
}

struct ScriptedProbe {
    steps: Mutex<VecDeque<Step>>,
    calls: AtomicUsize,
}

impl ScriptedProbe {
    fn new(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: AtomicUsize::new(0),
        })
    }

    fn push(&self, steps: impl IntoIterator<Item = Step>) {
        self.steps.lock().unwrap().extend(steps);
    }
}

#[async_trait]
impl ServiceProbe for ScriptedProbe {
    async fn check(&self, service: &str, _check: &ServiceCheck, _timeout: Duration) -> crate::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Up);
        match step {
            Step::Up => Ok(()),
            Step::Down => Err(Error::ConnectivityLoss {
                service: service.to_string(),
                message: "connection refused".to_string(),
            }),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
            Step::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

fn sampler(cpu: f64, memory: f64, disk: f64) -> Arc<dyn SystemSampler> {
    let mut mock = MockSystemSampler::new();
    mock.expect_sample().returning(move || SystemMetrics {
        cpu_percent: cpu,
        memory_percent: memory,
        disk_usage_percent: disk,
        timestamp: Utc::now(),
    });
    Arc::new(mock)
}

async fn setup(
    config: HealthConfig,
    probe: Arc<dyn ServiceProbe>,
    sampler: Arc<dyn SystemSampler>,
) -> (Arc<HealthMonitor>, mpsc::Receiver<Event>) {
    let bus = Arc::new(EventBus::new(Arc::new(MemoryBroker::new(256))));
    bus.start_listening(CancellationToken::new()).await.unwrap();
    let (_, rx) = bus.subscribe_channel(WILDCARD_CHANNEL);
    let monitor = Arc::new(HealthMonitor::new(config, bus, probe, sampler));
    (monitor, rx)
}

async fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<EventPayload> {
    tokio::time::sleep(Duration::from_millis(10)).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event.payload().unwrap());
    }
    events
}

fn status_changes(events: &[EventPayload]) -> Vec<(HealthStatus, HealthStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            EventPayload::ServiceStatusChanged {
                old_status,
                new_status,
                ..
            } => Some((*old_status, *new_status)),
            _ => None,
        })
        .collect()
}

fn service_downs(events: &[EventPayload]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            EventPayload::ServiceDown {
                consecutive_failures,
                ..
            } => Some(*consecutive_failures),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_three_timeouts_reach_critical_then_recover() {
    let probe = ScriptedProbe::new(std::iter::repeat(Step::Up).take(10));
    let (monitor, mut rx) = setup(HealthConfig::default(), probe.clone(), sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service(
        "content_api",
        ServiceCheck::Http("http://localhost:8000/health".to_string()),
        Some(Duration::from_secs(5)),
    );

    for _ in 0..10 {
        assert_eq!(
            monitor.check_service("content_api").await.unwrap(),
            HealthStatus::Healthy
        );
    }
    assert!(drain(&mut rx).await.is_empty());

    probe.push([Step::Hang, Step::Hang, Step::Hang]);
    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(monitor.check_service("content_api").await.unwrap());
    }
    assert_eq!(
        statuses,
        vec![HealthStatus::Healthy, HealthStatus::Healthy, HealthStatus::Critical]
    );

    let events = drain(&mut rx).await;
    assert_eq!(service_downs(&events), vec![1, 2, 3]);
    assert_eq!(
        status_changes(&events),
        vec![(HealthStatus::Healthy, HealthStatus::Critical)]
    );

    let health = monitor.get_service_health("content_api").unwrap();
    assert_eq!(health.consecutive_failures, 3);
    assert!(health.error_message.unwrap().contains("timed out"));
    assert!(health.response_time >= 5.0);

    assert_eq!(
        monitor.check_service("content_api").await.unwrap(),
        HealthStatus::Healthy
    );
    let events = drain(&mut rx).await;
    assert_eq!(
        status_changes(&events),
        vec![(HealthStatus::Critical, HealthStatus::Healthy)]
    );
    let health = monitor.get_service_health("content_api").unwrap();
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.total_checks, 14);
    assert_eq!(health.successful_checks, 11);
}

#[tokio::test(start_paused = true)]
async fn test_fresh_service_failure_is_unhealthy() {
    let probe = ScriptedProbe::new([Step::Down]);
    let (monitor, mut rx) = setup(HealthConfig::default(), probe, sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("redis", ServiceCheck::Redis("redis://localhost".into()), None);

    assert_eq!(
        monitor.check_service("redis").await.unwrap(),
        HealthStatus::Unhealthy
    );
    let events = drain(&mut rx).await;
    assert_eq!(service_downs(&events), vec![1]);
    assert_eq!(
        status_changes(&events),
        vec![(HealthStatus::Healthy, HealthStatus::Unhealthy)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_slow_responses_degrade() {
    let probe = ScriptedProbe::new([
        Step::Slow(Duration::from_secs(6)),
        Step::Slow(Duration::from_secs(16)),
        Step::Up,
    ]);
    let (monitor, _rx) = setup(HealthConfig::default(), probe, sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service(
        "slow",
        ServiceCheck::Http("http://slow/health".into()),
        Some(Duration::from_secs(30)),
    );

    assert_eq!(monitor.check_service("slow").await.unwrap(), HealthStatus::Degraded);
    assert_eq!(monitor.check_service("slow").await.unwrap(), HealthStatus::Critical);
    assert_eq!(monitor.check_service("slow").await.unwrap(), HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_success_rate_below_threshold_degrades_failure() {
    // 3 successes then 1 failure: success rate 0.75
    let probe = ScriptedProbe::new([Step::Up, Step::Up, Step::Up, Step::Down]);
    let (monitor, _rx) = setup(HealthConfig::default(), probe, sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("api", ServiceCheck::Http("http://api".into()), None);

    for _ in 0..3 {
        monitor.check_service("api").await.unwrap();
    }
    assert_eq!(monitor.check_service("api").await.unwrap(), HealthStatus::Degraded);
}

#[tokio::test(start_paused = true)]
async fn test_resource_alerts() {
    let (monitor, mut rx) = setup(
        HealthConfig::default(),
        ScriptedProbe::new(Vec::new()),
        sampler(95.0, 85.0, 10.0),
    )
    .await;

    monitor.run_cycle().await;

    let events = drain(&mut rx).await;
    let alerts: Vec<(String, AlertLevel, f64)> = events
        .iter()
        .filter_map(|e| match e {
            EventPayload::ResourceAlert {
                resource,
                level,
                threshold,
                ..
            } => Some((resource.clone(), *level, *threshold)),
            _ => None,
        })
        .collect();
    assert_eq!(
        alerts,
        vec![
            ("cpu".to_string(), AlertLevel::Critical, 90.0),
            ("memory".to_string(), AlertLevel::Degraded, 80.0),
        ]
    );
    assert_eq!(monitor.resource_pressure(), Some(AlertLevel::Critical));
    assert_eq!(monitor.latest_system_metrics().unwrap().cpu_percent, 95.0);
}

#[tokio::test(start_paused = true)]
async fn test_history_is_bounded() {
    let (monitor, _rx) = setup(
        HealthConfig::default().with_history_size(3),
        ScriptedProbe::new(Vec::new()),
        sampler(1.0, 1.0, 1.0),
    )
    .await;

    for _ in 0..5 {
        monitor.run_cycle().await;
    }
    assert_eq!(monitor.system_history().len(), 3);
    assert_eq!(monitor.resource_pressure(), None);
}

#[tokio::test(start_paused = true)]
async fn test_self_healing_recovers_service() {
    let probe = ScriptedProbe::new([Step::Down, Step::Up]);
    let config = HealthConfig::default()
        .with_max_consecutive_failures(1)
        .with_recovery_wait(Duration::from_secs(10));
    let (monitor, mut rx) = setup(config, probe.clone(), sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("worker", ServiceCheck::Tcp("127.0.0.1:9".into()), None);

    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    monitor.register_recovery_action(
        "worker",
        "restart",
        Arc::new(move |health: ServiceHealth| {
            let counter = Arc::clone(&counter);
            async move {
                assert_eq!(health.status, HealthStatus::Critical);
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
            .boxed()
        }),
    );

    monitor.run_cycle().await;

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        monitor.get_service_health("worker").unwrap().status,
        HealthStatus::Healthy
    );

    let events = drain(&mut rx).await;
    let recovered: Vec<&EventPayload> = events
        .iter()
        .filter(|e| matches!(e, EventPayload::ServiceRecovered { .. }))
        .collect();
    assert_eq!(recovered.len(), 1);
    if let EventPayload::ServiceRecovered { service, action, .. } = recovered[0] {
        assert_eq!(service, "worker");
        assert_eq!(action, "restart");
    }
    match events.last().unwrap() {
        EventPayload::HealthCheck { overall_status, .. } => {
            assert_eq!(*overall_status, HealthStatus::Healthy)
        }
        other => panic!("expected health_check last, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_recovery_action_moves_to_next() {
    let probe = ScriptedProbe::new([Step::Down, Step::Up]);
    let config = HealthConfig::default().with_max_consecutive_failures(1);
    let (monitor, _rx) = setup(config, probe, sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("worker", ServiceCheck::Tcp("127.0.0.1:9".into()), None);

    let second = Arc::new(AtomicUsize::new(0));
    monitor.register_recovery_action(
        "worker",
        "flush",
        Arc::new(|_: ServiceHealth| {
            async { Err::<(), Error>(Error::Internal("flush failed".into())) }.boxed()
        }),
    );
    let counter = Arc::clone(&second);
    monitor.register_recovery_action(
        "worker",
        "restart",
        Arc::new(move |_: ServiceHealth| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), Error>(())
            }
            .boxed()
        }),
    );

    monitor.run_cycle().await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
    assert_eq!(monitor.overall_status(), HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_unrecovered_service_stays_critical() {
    let probe = ScriptedProbe::new([Step::Down, Step::Down]);
    let config = HealthConfig::default().with_max_consecutive_failures(1);
    let (monitor, mut rx) = setup(config, probe, sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("worker", ServiceCheck::Tcp("127.0.0.1:9".into()), None);
    monitor.register_recovery_action("worker", "noop", Arc::new(|_: ServiceHealth| async { Ok::<(), Error>(()) }.boxed()));

    monitor.run_cycle().await;

    assert_eq!(monitor.overall_status(), HealthStatus::Critical);
    let events = drain(&mut rx).await;
    assert!(!events
        .iter()
        .any(|e| matches!(e, EventPayload::ServiceRecovered { .. })));
    assert_eq!(service_downs(&events), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_health_check_summary_and_overall_status() {
    let mut mock = MockServiceProbe::new();
    mock.expect_check().returning(|service, _, _| {
        if service == "broken" {
            Err(Error::transient(service, "503"))
        } else {
            Ok(())
        }
    });
    let (monitor, mut rx) = setup(HealthConfig::default(), Arc::new(mock), sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("ok", ServiceCheck::Http("http://ok".into()), None);
    monitor.register_service("broken", ServiceCheck::Http("http://broken".into()), None);

    monitor.run_cycle().await;

    let report = monitor.get_health_status();
    assert_eq!(report.overall_status, HealthStatus::Unhealthy);
    assert_eq!(report.services["ok"].status, HealthStatus::Healthy);
    assert!(report.system.is_some());
    assert!(!report.monitoring_active);

    let events = drain(&mut rx).await;
    match events.last().unwrap() {
        EventPayload::HealthCheck {
            overall_status,
            services,
            system,
            ..
        } => {
            assert_eq!(*overall_status, HealthStatus::Unhealthy);
            assert_eq!(services.len(), 2);
            assert!(system.is_some());
        }
        other => panic!("expected health_check, got {:?}", other),
    }
}

#[tokio::test]
async fn test_custom_probe_and_unregister() {
    let mut default_probe = MockServiceProbe::new();
    default_probe.expect_check().never();
    let mut custom = MockServiceProbe::new();
    custom.expect_check().times(1).returning(|_, _, _| Ok(()));

    let (monitor, _rx) = setup(HealthConfig::default(), Arc::new(default_probe), sampler(1.0, 1.0, 1.0)).await;
    monitor.register_probe("queue", Arc::new(custom), None);

    assert_eq!(monitor.check_service("queue").await.unwrap(), HealthStatus::Healthy);
    assert_eq!(
        monitor.get_service_health("queue").unwrap().check,
        ServiceCheck::Custom("queue".to_string())
    );

    assert!(monitor.unregister_service("queue"));
    assert!(!monitor.unregister_service("queue"));
    assert!(matches!(
        monitor.check_service("queue").await,
        Err(Error::NotFound(_))
    ));
    assert_eq!(monitor.overall_status(), HealthStatus::Healthy);
}

#[tokio::test(start_paused = true)]
async fn test_monitoring_loop_runs_and_stops() {
    let probe = ScriptedProbe::new(Vec::new());
    let config = HealthConfig::default().with_check_interval(Duration::from_secs(60));
    let (monitor, mut rx) = setup(config, probe.clone(), sampler(1.0, 1.0, 1.0)).await;
    monitor.register_service("api", ServiceCheck::Http("http://api".into()), None);

    let token = CancellationToken::new();
    monitor.start(token.clone());
    assert!(monitor.is_running());

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert_eq!(probe.calls.load(Ordering::SeqCst), 2);
    let summaries = drain(&mut rx)
        .await
        .into_iter()
        .filter(|e| matches!(e, EventPayload::HealthCheck { .. }))
        .count();
    assert_eq!(summaries, 2);

    token.cancel();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!monitor.is_running());
}

#[test]
fn test_status_ordering_and_wire_format() {
    assert!(HealthStatus::Healthy < HealthStatus::Degraded);
    assert!(HealthStatus::Unhealthy < HealthStatus::Critical);
    assert!(HealthStatus::Critical.needs_recovery());
    assert!(!HealthStatus::Degraded.needs_recovery());
    assert_eq!(
        serde_json::to_value(HealthStatus::Critical).unwrap(),
        serde_json::json!("critical")
    );
    assert_eq!(
        serde_json::to_value(AlertLevel::Degraded).unwrap(),
        serde_json::json!("degraded")
    );
}

#[test]
fn test_check_kinds() {
    assert_eq!(ServiceCheck::from_kind("redis", "redis://x").kind(), "redis");
    assert_eq!(ServiceCheck::from_kind("database", "db:5432").kind(), "tcp");
    assert_eq!(ServiceCheck::from_kind("whatever", "http://x").kind(), "http");
    assert_eq!(ServiceCheck::from_kind("http", "http://x").endpoint(), "http://x");
}

#[test]
fn test_threshold_levels() {
    let t = Threshold::new(70.0, 90.0);
    assert_eq!(t.level(69.9), None);
    assert_eq!(t.level(70.0), Some((AlertLevel::Degraded, 70.0)));
    assert_eq!(t.level(90.0), Some((AlertLevel::Critical, 90.0)));
}
