//! Integration tests for the provider resilience layer.
//!
//! Covers rate-limit windows, circuit breaker transitions, scoring properties
//! and the failover round trip through the orchestrator.

use std::sync::Arc;
use std::time::Duration;
use switchyard_orchestrator::config::{FailoverSettings, ProviderSettings};
use switchyard_orchestrator::resilience::scorer::{cost_score, performance_score};
use switchyard_orchestrator::resilience::{
    BreakerSettings, CallError, CircuitBreaker, ProviderHealth, ProviderInfo, ProviderMetadata, Recommendation,
    Requirements, ScoringOptions,
};
use switchyard_orchestrator::{
    CircuitState, CoreEvent, EventBus, LimitChange, OrchestrationError, Orchestrator, OrchestratorConfig,
};

fn orchestrator_with_provider(name: &str, settings: ProviderSettings) -> Orchestrator {
    let mut config = OrchestratorConfig::default();
    config.providers.insert(name.to_string(), settings);
    config.failover = FailoverSettings { auto_recovery: false, ..FailoverSettings::default() };
    Orchestrator::new(config).unwrap()
}

#[tokio::test]
async fn test_sixth_request_is_denied_until_window_rolls_over() {
    let orchestrator = orchestrator_with_provider(
        "openai",
        ProviderSettings { limit: Some(5), window_ms: 1_000, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();

    for i in 1..=5 {
        let status = resilience.check_rate_limit("openai");
        assert!(status.allowed, "request {i} should be admitted");
    }

    let sixth = resilience.check_rate_limit("openai");
    assert!(!sixth.allowed);
    assert!(sixth.exceeded);
    assert!((sixth.utilization - 100.0).abs() < f64::EPSILON);
    assert!(sixth.retry_after_ms > 0);
    assert_eq!(sixth.remaining, Some(0));

    tokio::time::sleep(Duration::from_millis(1_050)).await;

    let next = resilience.check_rate_limit("openai");
    assert!(next.allowed);
    assert_eq!(next.current_count, 1);
}

#[tokio::test]
async fn test_adjust_resets_counters_and_rejects_zero() {
    let orchestrator = orchestrator_with_provider(
        "openai",
        ProviderSettings { limit: Some(2), window_ms: 60_000, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();
    resilience.check_rate_limit("openai");
    resilience.check_rate_limit("openai");
    assert!(!resilience.check_rate_limit("openai").allowed);

    let status = resilience.adjust_rate_limit("openai", Some(10), Some(Duration::from_secs(30))).unwrap();
    assert_eq!(status.current_count, 0);
    assert_eq!(status.limit, Some(10));
    assert_eq!(status.window_ms, 30_000);
    assert!(resilience.check_rate_limit("openai").allowed);

    assert!(matches!(
        resilience.adjust_rate_limit("openai", Some(0), None),
        Err(OrchestrationError::InvalidAdjustment(_))
    ));
    assert!(matches!(resilience.apply_backoff("openai", 0.5), Err(OrchestrationError::InvalidAdjustment(_))));

    let status = resilience.reset_rate_limit("openai");
    assert_eq!(status.current_count, 0);
}

#[tokio::test]
async fn test_circuit_breaker_state_machine() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let breaker = CircuitBreaker::new(
        BreakerSettings { failure_threshold: 3, recovery_timeout: Duration::from_millis(40), half_open_attempts: 1 },
        events,
    );

    for _ in 0..2 {
        breaker.record_failure("p");
    }
    assert_eq!(breaker.state("p"), CircuitState::Closed);
    breaker.record_failure("p");
    assert_eq!(breaker.state("p"), CircuitState::Open);
    assert!(matches!(breaker.check("p"), Err(OrchestrationError::CircuitOpen(_))));

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(breaker.check("p").is_ok());
    assert_eq!(breaker.state("p"), CircuitState::HalfOpen);

    breaker.record_success("p");
    let snapshot = breaker.snapshot("p");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.failure_count, 0);
    assert_eq!(snapshot.consecutive_failures, 0);

    let mut transitions = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let CoreEvent::CircuitTransition { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        [
            (CircuitState::Closed, CircuitState::Open),
            (CircuitState::Open, CircuitState::HalfOpen),
            (CircuitState::HalfOpen, CircuitState::Closed),
        ]
    );
}

#[tokio::test]
async fn test_failed_probe_reopens_circuit() {
    let breaker = CircuitBreaker::new(
        BreakerSettings { failure_threshold: 1, recovery_timeout: Duration::from_millis(20), half_open_attempts: 1 },
        EventBus::default(),
    );
    breaker.record_failure("p");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert!(breaker.check("p").is_ok());

    breaker.record_failure("p");
    assert_eq!(breaker.state("p"), CircuitState::Open);
    assert!(breaker.check("p").is_err());
}

#[test]
fn test_scorer_is_monotonic() {
    let requirements = Requirements::for_capabilities(&["chat"]);
    let options = ScoringOptions::default();
    let with = |uptime: f64, cost: f64| {
        ProviderInfo::new("p", &["chat"]).with_metadata(ProviderMetadata {
            uptime_percentage: uptime,
            cost_per_1k_tokens: cost,
            ..ProviderMetadata::default()
        })
    };

    let mut previous = f64::MIN;
    for uptime in [0.0, 50.0, 90.0, 99.0, 99.9, 100.0] {
        let score = performance_score(&with(uptime, 0.01), &requirements);
        assert!(score >= previous, "uptime {uptime} lowered the performance score");
        previous = score;
    }

    let mut previous = f64::MAX;
    for cost in [0.0, 0.001, 0.01, 0.05, 0.5, 10.0] {
        let score = cost_score(&with(99.0, cost), &options);
        assert!(score <= previous, "cost {cost} raised the cost score");
        previous = score;
    }
}

#[tokio::test]
async fn test_guarded_call_records_outcomes() {
    let orchestrator = orchestrator_with_provider(
        "openai",
        ProviderSettings { failure_threshold: 2, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();

    for _ in 0..2 {
        let failed: Result<(), CallError<&str>> = resilience.call("openai", |_| async { Err("503") }).await;
        assert!(matches!(failed, Err(CallError::Failed("503"))));
    }
    assert_eq!(resilience.circuit_state("openai"), CircuitState::Open);

    let rejected: Result<(), CallError<&str>> = resilience.call("openai", |_| async { Ok(()) }).await;
    assert!(rejected.unwrap_err().is_rejected());
}

#[tokio::test]
async fn test_failover_trigger_and_recovery() {
    let orchestrator = orchestrator_with_provider(
        "primary",
        ProviderSettings { failure_threshold: 1, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();
    resilience.register_provider(ProviderInfo::new("primary", &["chat"]));
    resilience.register_provider(ProviderInfo::new("backup", &["chat"]));
    resilience.register_provider(ProviderInfo::new("down", &["chat"]).with_health(ProviderHealth::Unhealthy));
    let mut events = orchestrator.subscribe();

    resilience.record_failure("primary", Duration::from_millis(5));
    let assessment = resilience.detect_failover("primary").await;
    assert_eq!(assessment.recommendation, Recommendation::ImmediateFailover);

    let state = resilience.trigger_failover("primary", None, "circuit open").unwrap();
    assert_eq!(state.target_provider, "backup");
    assert_eq!(resilience.active_provider("primary"), "backup");

    let served_by: Result<String, CallError<String>> =
        resilience.call("primary", |target| async move { Ok(target) }).await;
    assert_eq!(served_by.unwrap(), "backup");

    assert!(matches!(
        resilience.attempt_recovery("primary").await,
        Err(OrchestrationError::RecoveryNotReady(_))
    ));
    assert_eq!(resilience.active_provider("primary"), "backup");

    resilience.reset_circuit_breaker("primary");
    for _ in 0..3 {
        resilience.record_success("primary", Duration::from_millis(5));
    }
    let status = resilience.monitor_failover("primary").await.unwrap();
    assert!(status.ready);
    resilience.attempt_recovery("primary").await.unwrap();
    assert_eq!(resilience.active_provider("primary"), "primary");
    assert!(matches!(resilience.monitor_failover("primary").await, Err(OrchestrationError::NotInFailover)));

    let mut triggered = false;
    let mut recovered = false;
    while let Ok(event) = events.try_recv() {
        match event {
            CoreEvent::FailoverTriggered { from, to, .. } => {
                assert_eq!((from.as_str(), to.as_str()), ("primary", "backup"));
                triggered = true;
            }
            CoreEvent::FailoverRecovered { provider, .. } => {
                assert_eq!(provider, "primary");
                recovered = true;
            }
            _ => {}
        }
    }
    assert!(triggered && recovered);

    let analysis = resilience.analyze_failure_patterns(None);
    assert_eq!(analysis.total_failovers, 1);
    assert_eq!(analysis.total_recoveries, 1);
    assert_eq!(analysis.unrecovered, 0);
}

#[tokio::test]
async fn test_failover_without_alternatives_is_surfaced() {
    let orchestrator = orchestrator_with_provider("solo", ProviderSettings::default());
    let resilience = orchestrator.resilience();
    resilience.register_provider(ProviderInfo::new("solo", &["chat"]));

    assert!(matches!(
        resilience.trigger_failover("solo", None, "manual"),
        Err(OrchestrationError::NoAlternatives(_))
    ));
    assert_eq!(resilience.active_provider("solo"), "solo");
}

#[tokio::test]
async fn test_recovery_monitor_runs_in_background() {
    let mut config = OrchestratorConfig::default();
    config.failover.monitor_interval_ms = 10;
    let orchestrator = Arc::new(Orchestrator::new(config).unwrap());
    let resilience = orchestrator.resilience();
    resilience.register_provider(ProviderInfo::new("a", &["chat"]));
    resilience.register_provider(ProviderInfo::new("b", &["chat"]));

    resilience.trigger_failover("a", None, "manual").unwrap();
    tokio::time::timeout(Duration::from_secs(1), async {
        while resilience.active_provider("a") != "a" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_open_circuit_failover_recovers_after_cooldown() {
    let orchestrator = orchestrator_with_provider(
        "primary",
        ProviderSettings { failure_threshold: 1, recovery_timeout_ms: 30, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();
    resilience.register_provider(ProviderInfo::new("primary", &["chat"]));
    resilience.register_provider(ProviderInfo::new("backup", &["chat"]));

    let failed: Result<(), CallError<String>> =
        resilience.call("primary", |_| async { Err("503".to_string()) }).await;
    assert!(matches!(failed, Err(CallError::Failed(_))));
    assert_eq!(resilience.circuit_state("primary"), CircuitState::Open);
    resilience.trigger_failover("primary", None, "circuit open").unwrap();

    // still cooling down
    assert!(matches!(
        resilience.attempt_recovery("primary").await,
        Err(OrchestrationError::RecoveryNotReady(_))
    ));

    tokio::time::sleep(Duration::from_millis(50)).await;
    resilience.attempt_recovery("primary").await.unwrap();
    assert_eq!(resilience.active_provider("primary"), "primary");
    assert_eq!(resilience.circuit_state("primary"), CircuitState::Closed);

    let served_by: Result<String, CallError<String>> =
        resilience.call("primary", |target| async move { Ok(target) }).await;
    assert_eq!(served_by.unwrap(), "primary");
}

#[tokio::test]
async fn test_background_monitor_recovers_open_circuit_failover() {
    let mut config = OrchestratorConfig::default();
    config.failover.monitor_interval_ms = 10;
    config.providers.insert(
        "primary".to_string(),
        ProviderSettings { failure_threshold: 1, recovery_timeout_ms: 30, ..ProviderSettings::default() },
    );
    let orchestrator = Orchestrator::new(config).unwrap();
    let resilience = orchestrator.resilience();
    resilience.register_provider(ProviderInfo::new("primary", &["chat"]));
    resilience.register_provider(ProviderInfo::new("backup", &["chat"]));

    resilience.record_failure("primary", Duration::from_millis(5));
    assert_eq!(resilience.detect_failover("primary").await.recommendation, Recommendation::ImmediateFailover);
    let state = resilience.trigger_failover("primary", None, "circuit open").unwrap();
    assert_eq!(state.target_provider, "backup");

    tokio::time::timeout(Duration::from_secs(2), async {
        while resilience.active_provider("primary") != "primary" {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(resilience.circuit_state("primary"), CircuitState::Closed);
    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_backoff_overflow_is_rejected() {
    let orchestrator = orchestrator_with_provider(
        "openai",
        ProviderSettings { limit: Some(10), window_ms: 1_000, ..ProviderSettings::default() },
    );
    let resilience = orchestrator.resilience();

    assert!(matches!(resilience.apply_backoff("openai", 1e30), Err(OrchestrationError::InvalidAdjustment(_))));
    assert_eq!(resilience.rate_limit_status("openai").window_ms, 1_000);

    let status = resilience.adjust_rate_limit("openai", LimitChange::Unlimited, None).unwrap();
    assert_eq!(status.limit, None);
}
