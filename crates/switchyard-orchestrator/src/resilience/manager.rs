//! Provider resilience facade.
//!
//! Owns the per-provider gates (rate limiter, circuit breaker, load tracking),
//! health reporting and failover, and exposes the guarded call engines use to
//! reach upstream providers.

use super::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use super::failover::{
    FailoverAssessment, FailoverOrchestrator, FailoverState, FailureAnalysis, FailureEvent, RecoveryStatus,
};
use super::health::{ConnectivityProbe, HealthMonitor, HealthReport, HealthTracker};
use super::load_balancer::LoadBalancer;
use super::providers::{ProviderDirectory, ProviderInfo};
use super::rate_limiter::{LimitChange, RateLimitStatus, RateLimiter, TuningSuggestion};
use super::scorer::{ProviderScore, ProviderScorer, Requirements};
use crate::config::{OrchestratorConfig, ProviderSettings};
use crate::error::{OrchestrationError, Result};
use crate::events::EventBus;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Failure of a guarded provider call.
#[derive(Debug, Error)]
pub enum CallError<E> {
    /// The call was never made.
    #[error(transparent)]
    Rejected(OrchestrationError),
    /// The provider call itself failed.
    #[error("Provider call failed: {0}")]
    Failed(E),
}

impl<E> CallError<E> {
    /// Returns `true` if the call was rejected before reaching the provider.
    #[must_use]
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Provider resilience layer.
pub struct Resilience {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    tracker: Arc<HealthTracker>,
    balancer: Arc<LoadBalancer>,
    directory: Arc<ProviderDirectory>,
    monitor: Arc<HealthMonitor>,
    failover: Arc<FailoverOrchestrator>,
    scorer: ProviderScorer,
}

impl fmt::Debug for Resilience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resilience")
            .field("directory", &self.directory)
            .field("failover", &self.failover)
            .finish_non_exhaustive()
    }
}

impl Resilience {
    /// Creates the resilience layer from configuration.
    ///
    /// Providers listed in `config.providers` get their own limiter and breaker
    /// settings; every other provider uses the defaults.
    ///
    /// # Arguments
    /// * `config` - Provider, scoring and failover settings
    /// * `probe` - Connectivity probe used by health checks
    /// * `events` - Sink for breaker, limiter and failover events
    #[must_use]
    pub fn new(config: &OrchestratorConfig, probe: Arc<dyn ConnectivityProbe>, events: &EventBus) -> Self {
        let defaults = ProviderSettings::default();
        let limiter = Arc::new(RateLimiter::new(defaults.rate_limit(), events.clone()));
        let breaker = Arc::new(CircuitBreaker::new(defaults.breaker(), events.clone()));
        for (provider, settings) in &config.providers {
            limiter.configure(provider, settings.rate_limit());
            breaker.configure(provider, settings.breaker());
        }

        let tracker = Arc::new(HealthTracker::default());
        let monitor = Arc::new(HealthMonitor::new(
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            Arc::clone(&tracker),
            probe,
        )
        .with_connectivity_timeout(config.failover.connectivity_timeout()));
        let directory = Arc::new(ProviderDirectory::new());
        let scorer = ProviderScorer::for_profile(config.scoring.profile);
        let failover = Arc::new(FailoverOrchestrator::new(
            Arc::clone(&monitor),
            Arc::clone(&breaker),
            Arc::clone(&directory),
            scorer,
            config.failover.clone(),
            events.clone(),
        ));

        Self {
            limiter,
            breaker,
            tracker,
            balancer: Arc::new(LoadBalancer::default()),
            directory,
            monitor,
            failover,
            scorer,
        }
    }

    /// Provider directory.
    pub fn directory(&self) -> &Arc<ProviderDirectory> {
        &self.directory
    }

    /// Registers a provider with the directory.
    pub fn register_provider(&self, info: ProviderInfo) -> bool {
        self.directory.register(info)
    }

    /// Load balancer.
    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Failover orchestrator.
    pub fn failover(&self) -> &Arc<FailoverOrchestrator> {
        &self.failover
    }

    // Rate limiting

    /// Admits one request against the provider's rate limit.
    pub fn check_rate_limit(&self, provider: &str) -> RateLimitStatus {
        self.limiter.check(provider)
    }

    /// Reports the provider's rate-limit window without admitting a request.
    pub fn rate_limit_status(&self, provider: &str) -> RateLimitStatus {
        self.limiter.status(provider)
    }

    /// Changes the provider's limit and/or window and resets its counters.
    ///
    /// `limit` takes a [`LimitChange`] or an `Option<u32>` (`None` keeps it).
    ///
    /// # Errors
    /// Returns `InvalidAdjustment` for a zero limit, or a zero or over-long window.
    pub fn adjust_rate_limit(
        &self,
        provider: &str,
        limit: impl Into<LimitChange>,
        window: Option<Duration>,
    ) -> Result<RateLimitStatus> {
        self.limiter.adjust(provider, limit, window)
    }

    /// Starts a fresh window for the provider.
    pub fn reset_rate_limit(&self, provider: &str) -> RateLimitStatus {
        self.limiter.reset(provider)
    }

    /// Widens the window and shrinks the limit by `factor`.
    ///
    /// # Errors
    /// Returns `InvalidAdjustment` if `factor` is below 1, not finite, or
    /// would stretch the window past a day.
    pub fn apply_backoff(&self, provider: &str, factor: f64) -> Result<RateLimitStatus> {
        self.limiter.backoff(provider, factor)
    }

    /// Restores the provider's configured limit and window.
    pub fn recover_rate_limit(&self, provider: &str) -> RateLimitStatus {
        self.limiter.recover(provider)
    }

    /// Suggests a new limit from observed utilization.
    pub fn auto_tune(&self, provider: &str) -> Option<TuningSuggestion> {
        self.limiter.auto_tune(provider)
    }

    // Circuit breaking

    /// Current circuit state.
    pub fn circuit_state(&self, provider: &str) -> CircuitState {
        self.breaker.state(provider)
    }

    /// Full circuit snapshot.
    pub fn circuit_snapshot(&self, provider: &str) -> CircuitSnapshot {
        self.breaker.snapshot(provider)
    }

    /// Forces the circuit closed with zeroed counters.
    pub fn reset_circuit_breaker(&self, provider: &str) {
        self.breaker.reset(provider);
    }

    /// Records a successful provider call made outside [`Resilience::call`].
    pub fn record_success(&self, provider: &str, latency: Duration) {
        self.breaker.record_success(provider);
        self.tracker.record_success(provider, latency);
    }

    /// Records a failed provider call made outside [`Resilience::call`].
    pub fn record_failure(&self, provider: &str, latency: Duration) {
        self.breaker.record_failure(provider);
        self.tracker.record_failure(provider, latency);
    }

    // Health and failover

    /// Runs a health check.
    ///
    /// # Errors
    /// Returns `HealthCheckFailed` if the connectivity probe failed.
    pub async fn run_health_check(&self, provider: &str) -> Result<HealthReport> {
        let report = self.monitor.assess(provider).await;
        match &report.connectivity_error {
            Some(reason) => Err(OrchestrationError::HealthCheckFailed {
                provider: provider.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(report),
        }
    }

    /// Runs a health check and recommends a failover action.
    pub async fn detect_failover(&self, provider: &str) -> FailoverAssessment {
        self.failover.detect(provider).await
    }

    /// Moves traffic away from `provider`.
    ///
    /// # Errors
    /// See [`FailoverOrchestrator::trigger`].
    pub fn trigger_failover(&self, provider: &str, target: Option<&str>, reason: &str) -> Result<FailoverState> {
        self.failover.trigger(provider, target, reason)
    }

    /// Compares original and current provider health during a failover.
    ///
    /// # Errors
    /// Returns `NotInFailover` if no failover is active for `provider`.
    pub async fn monitor_failover(&self, provider: &str) -> Result<RecoveryStatus> {
        self.failover.monitor(provider).await
    }

    /// Fails back to `provider` if it has recovered.
    ///
    /// # Errors
    /// Returns `NotInFailover` or `RecoveryNotReady`; the failover stays active.
    pub async fn attempt_recovery(&self, provider: &str) -> Result<Duration> {
        self.failover.recover(provider).await
    }

    /// Provider currently serving traffic for `provider`.
    pub fn active_provider(&self, provider: &str) -> String {
        self.failover.active_provider(provider)
    }

    /// Analyzes failover history.
    pub fn analyze_failure_patterns(&self, events: Option<&[FailureEvent]>) -> FailureAnalysis {
        self.failover.analyze_failure_patterns(events)
    }

    /// Starts the automatic recovery monitor.
    pub fn spawn_recovery_monitor(&self, interval: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        self.failover.spawn_recovery_monitor(interval, shutdown)
    }

    /// Picks the best registered provider for `requirements` that has spare
    /// capacity and a circuit that is not open.
    pub fn select_provider(&self, requirements: &Requirements) -> Option<ProviderScore> {
        let candidates: Vec<ProviderInfo> = self
            .directory
            .list()
            .into_iter()
            .filter(|p| self.breaker.state(&p.id) != CircuitState::Open)
            .filter(|p| requirements.capabilities.iter().all(|c| p.supports(c)))
            .collect();
        self.balancer.select(&candidates, requirements, &self.scorer)
    }

    /// Calls a provider through the rate limiter and circuit breaker.
    ///
    /// The call is routed to the active provider when `provider` is in
    /// failover. Its outcome feeds the breaker and the health tracker, and it
    /// counts as in-flight load until it completes.
    ///
    /// # Arguments
    /// * `provider` - Provider the caller wants to reach
    /// * `call` - Makes the request against the provider it is given
    ///
    /// # Errors
    /// Returns `CallError::Rejected` with `RateLimited` or `CircuitOpen` when
    /// the call was not made, or `CallError::Failed` with the call's own error.
    pub async fn call<T, E, F, Fut>(&self, provider: &str, call: F) -> std::result::Result<T, CallError<E>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let target = self.active_provider(provider);

        let admission = self.limiter.check(&target);
        if !admission.allowed {
            return Err(CallError::Rejected(OrchestrationError::RateLimited {
                provider: target,
                retry_after_ms: admission.retry_after_ms,
            }));
        }
        self.breaker.check(&target).map_err(CallError::Rejected)?;

        let _load = self.balancer.track(&target);
        let started = Instant::now();
        let outcome = call(target.clone()).await;
        let latency = started.elapsed();

        match outcome {
            Ok(value) => {
                self.record_success(&target, latency);
                debug!(provider = %target, latency_ms = latency.as_millis(), "Provider call succeeded");
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&target, latency);
                warn!(provider = %target, latency_ms = latency.as_millis(), "Provider call failed");
                Err(CallError::Failed(e))
            }
        }
    }
}
