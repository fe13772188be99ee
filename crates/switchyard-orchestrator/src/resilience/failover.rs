//! Provider failover: detect degraded providers, move traffic to the best
//! alternate, watch the original and fail back once it recovers.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::health::{HealthMonitor, HealthReport};
use super::providers::ProviderDirectory;
use super::scorer::{ProviderScore, ProviderScorer, Requirements};
use crate::config::FailoverSettings;
use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::server::duration_ms;
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Success rate below which a provider is considered failing.
const MIN_SUCCESS_RATE: f64 = 0.8;

/// Rate-limit utilization (percent) considered saturated.
const SATURATED_UTILIZATION: f64 = 90.0;

/// Health score below which a provider is considered degraded.
const MIN_HEALTH_SCORE: f64 = 0.5;

/// Failover history kept for analysis.
const HISTORY_LIMIT: usize = 1_000;

/// An active failover away from one provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverState {
    /// Provider traffic was moved away from.
    pub original_provider: String,
    /// Provider currently serving the traffic.
    pub target_provider: String,
    /// When the first failover happened.
    pub started_at: DateTime<Utc>,
    /// Failovers performed for this provider.
    pub attempt_count: u32,
    /// Failovers allowed before giving up.
    pub max_attempts: u32,
    /// Whether the recovery monitor may fail back on its own.
    pub auto_recovery_enabled: bool,
    /// Health score the original must reach before failing back.
    pub recovery_threshold: f64,
    /// Why the last failover happened.
    pub reason: String,
}

/// Trigger flags derived from a health report.
#[allow(clippy::struct_excessive_bools)] // One flag per trigger
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FailoverTriggers {
    /// The circuit is open.
    pub circuit_open: bool,
    /// Recent success rate is too low.
    pub low_success_rate: bool,
    /// The connectivity probe failed.
    pub connectivity_failed: bool,
    /// The rate limit is nearly exhausted.
    pub rate_limit_saturated: bool,
    /// The composite health score is too low.
    pub low_health_score: bool,
}

impl FailoverTriggers {
    /// Derives triggers from a health report.
    #[must_use]
    pub fn from_report(report: &HealthReport) -> Self {
        Self {
            circuit_open: report.circuit_state == CircuitState::Open,
            low_success_rate: report.outcomes.success_rate < MIN_SUCCESS_RATE,
            connectivity_failed: !report.is_reachable(),
            rate_limit_saturated: report.rate_limit_utilization >= SATURATED_UTILIZATION,
            low_health_score: report.health_score < MIN_HEALTH_SCORE,
        }
    }

    /// Number of triggers that fired.
    #[must_use]
    pub fn count(&self) -> usize {
        self.names().len()
    }

    /// Names of the triggers that fired.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        [
            (self.circuit_open, "circuit_open"),
            (self.low_success_rate, "low_success_rate"),
            (self.connectivity_failed, "connectivity_failed"),
            (self.rate_limit_saturated, "rate_limit_saturated"),
            (self.low_health_score, "low_health_score"),
        ]
        .into_iter()
        .filter_map(|(fired, name)| fired.then_some(name))
        .collect()
    }

    /// Maps the fired triggers to a recommendation.
    #[must_use]
    pub fn recommendation(&self) -> Recommendation {
        if self.circuit_open || self.connectivity_failed {
            Recommendation::ImmediateFailover
        } else if self.count() >= 2 {
            Recommendation::ScheduledFailover
        } else if self.count() == 1 {
            Recommendation::MonitorClosely
        } else {
            Recommendation::NoAction
        }
    }
}

/// What detection recommends doing about a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    /// Fail over now.
    ImmediateFailover,
    /// Fail over at the next opportunity.
    ScheduledFailover,
    /// Keep watching.
    MonitorClosely,
    /// Nothing to do.
    NoAction,
}

/// Result of failover detection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailoverAssessment {
    /// Health report the decision is based on.
    pub report: HealthReport,
    /// Triggers that fired.
    pub triggers: FailoverTriggers,
    /// Recommended action.
    pub recommendation: Recommendation,
}

/// Comparison of the original and current provider during a failover.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    /// Provider traffic was moved away from.
    pub original_provider: String,
    /// Provider currently serving the traffic.
    pub target_provider: String,
    /// Original provider's health score.
    pub original_health: f64,
    /// Current provider's health score.
    pub current_health: f64,
    /// Score the original must reach.
    pub recovery_threshold: f64,
    /// Whether failing back is recommended.
    pub ready: bool,
}

/// Kind of recorded failover event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Traffic moved away from a provider.
    Failover,
    /// Traffic returned to a provider.
    Recovery,
}

/// A recorded failover or recovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureEvent {
    /// Event kind.
    pub kind: FailureKind,
    /// Original provider.
    pub provider: String,
    /// Provider traffic moved to, for failovers.
    pub target: Option<String>,
    /// Reason given for the failover.
    pub reason: String,
    /// Triggers that fired, for detected failovers.
    pub triggers: Vec<String>,
    /// When it happened.
    pub at: DateTime<Utc>,
    /// Time spent in failover, for recoveries.
    pub recovery_time_ms: Option<u64>,
}

/// Retrospective statistics over failover history.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FailureAnalysis {
    /// Failovers in the history.
    pub total_failovers: usize,
    /// Recoveries in the history.
    pub total_recoveries: usize,
    /// Failovers per original provider.
    pub failovers_by_provider: BTreeMap<String, usize>,
    /// How often each trigger fired.
    pub trigger_counts: BTreeMap<String, usize>,
    /// Failovers per UTC hour of day.
    pub failovers_by_hour: BTreeMap<u32, usize>,
    /// Mean time between consecutive failovers.
    pub mean_interval_ms: Option<u64>,
    /// Mean time spent in failover.
    pub avg_recovery_ms: Option<u64>,
    /// Longest time spent in failover.
    pub max_recovery_ms: Option<u64>,
    /// Total time spent in failover.
    pub total_degraded_ms: u64,
    /// Failovers without a matching recovery.
    pub unrecovered: usize,
    /// Suggested follow-ups.
    pub recommendations: Vec<String>,
}

/// Analyzes failover history. Pure; never touches live state.
#[must_use]
pub fn analyze_failures(events: &[FailureEvent]) -> FailureAnalysis {
    let mut analysis = FailureAnalysis::default();
    let mut failover_times: Vec<DateTime<Utc>> = Vec::new();
    let mut recovery_times: Vec<u64> = Vec::new();

    for event in events {
        match event.kind {
            FailureKind::Failover => {
                analysis.total_failovers += 1;
                *analysis.failovers_by_provider.entry(event.provider.clone()).or_default() += 1;
                *analysis.failovers_by_hour.entry(event.at.hour()).or_default() += 1;
                for trigger in &event.triggers {
                    *analysis.trigger_counts.entry(trigger.clone()).or_default() += 1;
                }
                failover_times.push(event.at);
            }
            FailureKind::Recovery => {
                analysis.total_recoveries += 1;
                if let Some(ms) = event.recovery_time_ms {
                    recovery_times.push(ms);
                }
            }
        }
    }

    failover_times.sort();
    let intervals: Vec<u64> = failover_times
        .windows(2)
        .filter_map(|pair| u64::try_from((pair[1] - pair[0]).num_milliseconds()).ok())
        .collect();
    analysis.mean_interval_ms = mean(&intervals);
    analysis.avg_recovery_ms = mean(&recovery_times);
    analysis.max_recovery_ms = recovery_times.iter().copied().max();
    analysis.total_degraded_ms = recovery_times.iter().sum();

    let distinct_failed_over: usize = analysis.failovers_by_provider.len();
    analysis.unrecovered = analysis.total_failovers.saturating_sub(analysis.total_recoveries);
    analysis.recommendations = recommendations(&analysis, distinct_failed_over);
    analysis
}

fn mean(values: &[u64]) -> Option<u64> {
    let count = u64::try_from(values.len()).ok().filter(|n| *n > 0)?;
    Some(values.iter().sum::<u64>() / count)
}

fn recommendations(analysis: &FailureAnalysis, distinct_providers: usize) -> Vec<String> {
    let mut out = Vec::new();
    if analysis.total_failovers == 0 {
        out.push("No failovers recorded; no action needed".to_string());
        return out;
    }
    if let Some((provider, count)) = analysis.failovers_by_provider.iter().max_by_key(|(_, c)| **c) {
        if *count >= 3 {
            out.push(format!("Provider '{provider}' failed over {count} times; review its capacity or deprioritize it"));
        }
    }
    if let Some((trigger, _)) = analysis.trigger_counts.iter().max_by_key(|(_, c)| **c) {
        match trigger.as_str() {
            "rate_limit_saturated" => out.push("Rate limits are the main trigger; raise limits or spread load".to_string()),
            "circuit_open" | "low_success_rate" => {
                out.push("Provider errors are the main trigger; check upstream stability".to_string());
            }
            "connectivity_failed" => out.push("Connectivity is the main trigger; check network paths".to_string()),
            _ => {}
        }
    }
    if analysis.mean_interval_ms.is_some_and(|ms| ms < 5 * 60 * 1_000) {
        out.push("Failovers are frequent; consider a longer recovery threshold".to_string());
    }
    if analysis.avg_recovery_ms.is_some_and(|ms| ms > 30 * 60 * 1_000) {
        out.push("Recoveries are slow; consider promoting the alternate provider".to_string());
    }
    if analysis.unrecovered > 0 {
        out.push(format!("{} failover(s) never recovered", analysis.unrecovered));
    }
    if distinct_providers > 1 && out.is_empty() {
        out.push("Failovers are spread across providers; no single provider stands out".to_string());
    }
    out
}

/// Failover orchestrator.
pub struct FailoverOrchestrator {
    monitor: Arc<HealthMonitor>,
    breaker: Arc<CircuitBreaker>,
    directory: Arc<ProviderDirectory>,
    scorer: ProviderScorer,
    settings: FailoverSettings,
    active: Mutex<HashMap<String, FailoverState>>,
    history: Mutex<Vec<FailureEvent>>,
    events: EventBus,
}

impl fmt::Debug for FailoverOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailoverOrchestrator")
            .field("settings", &self.settings)
            .field("active", &self.active().len())
            .finish_non_exhaustive()
    }
}

impl FailoverOrchestrator {
    /// Creates an orchestrator.
    ///
    /// # Arguments
    /// * `monitor` - Source of provider health reports
    /// * `breaker` - Circuit breaker, used to skip open providers
    /// * `directory` - Source of alternate providers
    /// * `scorer` - Ranks alternates
    /// * `settings` - Attempts, threshold and auto-recovery
    /// * `events` - Sink for failover notices
    #[must_use]
    pub fn new(
        monitor: Arc<HealthMonitor>,
        breaker: Arc<CircuitBreaker>,
        directory: Arc<ProviderDirectory>,
        scorer: ProviderScorer,
        settings: FailoverSettings,
        events: EventBus,
    ) -> Self {
        Self {
            monitor,
            breaker,
            directory,
            scorer,
            settings,
            active: Mutex::new(HashMap::new()),
            history: Mutex::new(Vec::new()),
            events,
        }
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, FailoverState>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, event: FailureEvent) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        if history.len() == HISTORY_LIMIT {
            history.remove(0);
        }
        history.push(event);
    }

    /// Runs a health check and recommends an action.
    pub async fn detect(&self, provider: &str) -> FailoverAssessment {
        let report = self.monitor.assess(provider).await;
        let triggers = FailoverTriggers::from_report(&report);
        let recommendation = triggers.recommendation();
        if recommendation != Recommendation::NoAction {
            info!(provider = %provider, triggers = ?triggers.names(), recommendation = ?recommendation, "Failover detection");
        }
        FailoverAssessment { report, triggers, recommendation }
    }

    /// Moves traffic away from `provider`.
    ///
    /// Uses `target` when given, otherwise the highest-scored available
    /// alternate whose circuit is not open.
    ///
    /// # Errors
    /// Returns `UnknownProvider` for an unknown explicit target, `NoAlternatives`
    /// if no alternate is available, or `FailoverExhausted` once `max_attempts`
    /// failovers were made for this provider.
    pub fn trigger(&self, provider: &str, target: Option<&str>, reason: &str) -> Result<FailoverState> {
        self.trigger_with(provider, target, reason, Vec::new())
    }

    fn trigger_with(
        &self,
        provider: &str,
        target: Option<&str>,
        reason: &str,
        triggers: Vec<String>,
    ) -> Result<FailoverState> {
        // Held until the new state is stored so concurrent triggers count attempts in order.
        let mut active = self.active();
        let previous = active.get(provider);
        let attempt = previous.map_or(1, |s| s.attempt_count + 1);
        if attempt > self.settings.max_attempts {
            warn!(provider = %provider, attempts = attempt - 1, "Failover attempts exhausted");
            return Err(OrchestrationError::FailoverExhausted {
                provider: provider.to_string(),
                attempts: attempt - 1,
            });
        }

        let selected = match target {
            Some(target) if target == provider => {
                return Err(OrchestrationError::NoAlternatives(provider.to_string()));
            }
            Some(target) => {
                self.directory.get(target).ok_or_else(|| OrchestrationError::UnknownProvider(target.to_string()))?;
                target.to_string()
            }
            None => self
                .best_alternative(provider, previous.map(|s| s.target_provider.as_str()))
                .map(|score| score.provider)
                .ok_or_else(|| OrchestrationError::NoAlternatives(provider.to_string()))?,
        };

        let state = FailoverState {
            original_provider: provider.to_string(),
            target_provider: selected.clone(),
            started_at: previous.map_or_else(Utc::now, |s| s.started_at),
            attempt_count: attempt,
            max_attempts: self.settings.max_attempts,
            auto_recovery_enabled: self.settings.auto_recovery,
            recovery_threshold: self.settings.recovery_threshold,
            reason: reason.to_string(),
        };
        active.insert(provider.to_string(), state.clone());
        drop(active);

        warn!(from = %provider, to = %selected, attempt, reason = %reason, "Failover triggered");
        self.events.emit(CoreEvent::FailoverTriggered {
            from: provider.to_string(),
            to: selected.clone(),
            reason: reason.to_string(),
        });
        self.record(FailureEvent {
            kind: FailureKind::Failover,
            provider: provider.to_string(),
            target: Some(selected),
            reason: reason.to_string(),
            triggers,
            at: Utc::now(),
            recovery_time_ms: None,
        });
        Ok(state)
    }

    fn best_alternative(&self, provider: &str, current_target: Option<&str>) -> Option<ProviderScore> {
        let requirements = self
            .directory
            .get(provider)
            .map(|info| Requirements { capabilities: info.capabilities, ..Requirements::default() })
            .unwrap_or_default();
        let candidates: Vec<_> = self
            .directory
            .alternatives(provider)
            .into_iter()
            .filter(|p| Some(p.id.as_str()) != current_target)
            .filter(|p| self.breaker.state(&p.id) != CircuitState::Open)
            .collect();
        self.scorer.best(&candidates, &requirements)
    }

    /// Detects trouble and fails over when detection recommends it.
    ///
    /// # Returns
    /// The new failover state, or `None` when no failover was needed.
    ///
    /// # Errors
    /// Returns the `trigger` error when a recommended failover cannot be made.
    pub async fn detect_and_failover(&self, provider: &str) -> Result<Option<FailoverState>> {
        let assessment = self.detect(provider).await;
        match assessment.recommendation {
            Recommendation::ImmediateFailover | Recommendation::ScheduledFailover => {
                let names: Vec<String> = assessment.triggers.names().into_iter().map(String::from).collect();
                let reason = format!("{:?}: {}", assessment.recommendation, names.join(", "));
                self.trigger_with(provider, None, &reason, names).map(Some)
            }
            Recommendation::MonitorClosely | Recommendation::NoAction => Ok(None),
        }
    }

    /// Compares the original and current provider's health.
    ///
    /// An original whose circuit has cooled down first gets a recovery check,
    /// so a provider that failed over on an open circuit can close it again
    /// without regular traffic.
    ///
    /// # Errors
    /// Returns `NotInFailover` if `provider` has no active failover.
    pub async fn monitor(&self, provider: &str) -> Result<RecoveryStatus> {
        let state = self.state(provider).ok_or(OrchestrationError::NotInFailover)?;
        self.monitor.attempt_circuit_recovery(&state.original_provider).await;
        let original = self.monitor.assess(&state.original_provider).await;
        let current = self.monitor.assess(&state.target_provider).await;
        let ready = original.health_score >= state.recovery_threshold;

        debug!(
            provider = %provider,
            original_health = original.health_score,
            current_health = current.health_score,
            ready,
            "Failover monitor"
        );

        Ok(RecoveryStatus {
            original_provider: state.original_provider,
            target_provider: state.target_provider,
            original_health: original.health_score,
            current_health: current.health_score,
            recovery_threshold: state.recovery_threshold,
            ready,
        })
    }

    /// Fails back to the original provider once it clears the recovery threshold.
    ///
    /// # Returns
    /// How long the failover lasted.
    ///
    /// # Errors
    /// Returns `NotInFailover` if no failover is active, or `RecoveryNotReady`
    /// if the original is still below the threshold; the failover stays active.
    pub async fn recover(&self, provider: &str) -> Result<Duration> {
        let status = self.monitor(provider).await?;
        if !status.ready {
            return Err(OrchestrationError::RecoveryNotReady(format!(
                "'{provider}' health {:.2} is below the recovery threshold {:.2}",
                status.original_health, status.recovery_threshold
            )));
        }

        let state = self.active().remove(provider).ok_or(OrchestrationError::NotInFailover)?;
        let elapsed = (Utc::now() - state.started_at).to_std().unwrap_or_default();
        let duration_ms = duration_ms(elapsed);

        info!(provider = %provider, duration_ms, "Failover recovered");
        self.events.emit(CoreEvent::FailoverRecovered { provider: provider.to_string(), duration_ms });
        self.record(FailureEvent {
            kind: FailureKind::Recovery,
            provider: provider.to_string(),
            target: Some(state.target_provider),
            reason: "original provider recovered".to_string(),
            triggers: Vec::new(),
            at: Utc::now(),
            recovery_time_ms: Some(duration_ms),
        });
        Ok(elapsed)
    }

    /// Provider currently serving traffic for `provider`.
    pub fn active_provider(&self, provider: &str) -> String {
        self.active().get(provider).map_or_else(|| provider.to_string(), |s| s.target_provider.clone())
    }

    /// Active failover away from `provider`, if any.
    pub fn state(&self, provider: &str) -> Option<FailoverState> {
        self.active().get(provider).cloned()
    }

    /// Every active failover.
    pub fn active_failovers(&self) -> Vec<FailoverState> {
        let mut states: Vec<FailoverState> = self.active().values().cloned().collect();
        states.sort_by(|a, b| a.original_provider.cmp(&b.original_provider));
        states
    }

    /// Recorded failovers and recoveries, oldest first.
    pub fn history(&self) -> Vec<FailureEvent> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Analyzes the recorded history, or `events` when given.
    pub fn analyze_failure_patterns(&self, events: Option<&[FailureEvent]>) -> FailureAnalysis {
        match events {
            Some(events) => analyze_failures(events),
            None => analyze_failures(&self.history()),
        }
    }

    /// Spawns a loop that fails back every auto-recovering failover once its
    /// original provider is ready. The loop exits when `shutdown` is cancelled.
    pub fn spawn_recovery_monitor(self: &Arc<Self>, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => orchestrator.recover_ready().await,
                    () = shutdown.cancelled() => {
                        debug!("Recovery monitor stopped");
                        break;
                    }
                }
            }
        })
    }

    async fn recover_ready(&self) {
        let candidates: Vec<String> = self
            .active_failovers()
            .into_iter()
            .filter(|s| s.auto_recovery_enabled)
            .map(|s| s.original_provider)
            .collect();
        for provider in candidates {
            match self.recover(&provider).await {
                Ok(_) => {}
                Err(OrchestrationError::RecoveryNotReady(reason)) => debug!(provider = %provider, reason = %reason, "Not recovering yet"),
                Err(e) => warn!(provider = %provider, error = %e, "Automatic recovery failed"),
            }
        }
    }
}
