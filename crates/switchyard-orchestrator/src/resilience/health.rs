//! Provider health: sliding-window outcome tracking, connectivity probing and
//! the composite health report used by failover detection.

use super::circuit_breaker::{CircuitBreaker, CircuitState};
use super::providers::ProviderHealth;
use super::rate_limiter::RateLimiter;
use crate::server::duration_ms;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default bound on a single connectivity check.
const DEFAULT_CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(5);

/// Checks whether a provider can be reached.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Probes a provider.
    ///
    /// # Errors
    /// Returns a description of the failure if the provider is unreachable.
    async fn probe(&self, provider: &str) -> Result<(), String>;
}

/// Probe that reports every provider as reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl ConnectivityProbe for AlwaysReachable {
    async fn probe(&self, _provider: &str) -> Result<(), String> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
    latency: Duration,
}

/// Outcome statistics for one provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OutcomeStats {
    /// Successful calls in the window.
    pub successes: usize,
    /// Failed calls in the window.
    pub failures: usize,
    /// Successes over all calls; 1.0 with no calls.
    pub success_rate: f64,
    /// Mean latency in the window.
    pub avg_latency_ms: Option<u64>,
}

/// Sliding-window record of provider call outcomes.
pub struct HealthTracker {
    samples: RwLock<HashMap<String, VecDeque<Sample>>>,
    /// Window duration (default: 5 minutes).
    window_duration: Duration,
}

impl fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthTracker").field("window_duration", &self.window_duration).finish_non_exhaustive()
    }
}

impl HealthTracker {
    /// Creates a tracker keeping outcomes for `window_duration`.
    #[must_use]
    pub fn new(window_duration: Duration) -> Self {
        Self { samples: RwLock::new(HashMap::new()), window_duration }
    }

    fn record(&self, provider: &str, success: bool, latency: Duration) {
        let now = Instant::now();
        let mut samples = self.samples.write().unwrap_or_else(PoisonError::into_inner);
        let window = samples.entry(provider.to_string()).or_default();
        window.push_back(Sample { at: now, success, latency });
        while window.front().is_some_and(|s| now.duration_since(s.at) > self.window_duration) {
            window.pop_front();
        }
    }

    /// Records a successful call.
    pub fn record_success(&self, provider: &str, latency: Duration) {
        self.record(provider, true, latency);
    }

    /// Records a failed call.
    pub fn record_failure(&self, provider: &str, latency: Duration) {
        self.record(provider, false, latency);
    }

    /// Outcome statistics within the window.
    pub fn stats(&self, provider: &str) -> OutcomeStats {
        let samples = self.samples.read().unwrap_or_else(PoisonError::into_inner);
        let Some(window) = samples.get(provider) else {
            return OutcomeStats { success_rate: 1.0, ..OutcomeStats::default() };
        };

        let now = Instant::now();
        let live: Vec<&Sample> = window.iter().filter(|s| now.duration_since(s.at) <= self.window_duration).collect();
        let successes = live.iter().filter(|s| s.success).count();
        let failures = live.len() - successes;

        #[allow(clippy::cast_precision_loss)] // Sample counts are small
        let success_rate = if live.is_empty() { 1.0 } else { successes as f64 / live.len() as f64 };
        let avg_latency_ms = u32::try_from(live.len())
            .ok()
            .filter(|n| *n > 0)
            .map(|n| duration_ms(live.iter().map(|s| s.latency).sum::<Duration>() / n));

        OutcomeStats { successes, failures, success_rate, avg_latency_ms }
    }

    /// Success rate within the window; 1.0 with no calls.
    pub fn success_rate(&self, provider: &str) -> f64 {
        self.stats(provider).success_rate
    }

    /// Forgets a provider's outcomes.
    pub fn clear(&self, provider: &str) {
        self.samples.write().unwrap_or_else(PoisonError::into_inner).remove(provider);
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

/// Composite health of a provider at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    /// Provider id.
    pub provider: String,
    /// Circuit state.
    pub circuit_state: CircuitState,
    /// Recent call outcomes.
    pub outcomes: OutcomeStats,
    /// Connectivity probe failure, if any.
    pub connectivity_error: Option<String>,
    /// Rate-limit utilization, percent.
    pub rate_limit_utilization: f64,
    /// Weighted health score in `[0, 1]`.
    pub health_score: f64,
    /// Health class derived from the score.
    pub health: ProviderHealth,
    /// When the check ran.
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Returns `true` if the connectivity probe succeeded.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        self.connectivity_error.is_none()
    }
}

/// Builds health reports from the breaker, the limiter, the tracker and the probe.
pub struct HealthMonitor {
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    tracker: Arc<HealthTracker>,
    probe: Arc<dyn ConnectivityProbe>,
    connectivity_timeout: Duration,
}

impl fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("tracker", &self.tracker)
            .field("connectivity_timeout", &self.connectivity_timeout)
            .finish_non_exhaustive()
    }
}

impl HealthMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        tracker: Arc<HealthTracker>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        Self { breaker, limiter, tracker, probe, connectivity_timeout: DEFAULT_CONNECTIVITY_TIMEOUT }
    }

    /// Bounds every connectivity check by `timeout` (default: 5 seconds).
    #[must_use]
    pub fn with_connectivity_timeout(mut self, timeout: Duration) -> Self {
        self.connectivity_timeout = timeout;
        self
    }

    /// Runs the connectivity check, failing it once the timeout expires.
    ///
    /// # Errors
    /// Returns the reported failure, or a timeout description.
    pub async fn check_connectivity(&self, provider: &str) -> Result<(), String> {
        let timeout = self.connectivity_timeout;
        let outcome = tokio::time::timeout(timeout, self.probe.probe(provider)).await.unwrap_or_else(|_| {
            Err(format!("connectivity check timed out after {}ms", duration_ms(timeout)))
        });
        if let Err(reason) = &outcome {
            warn!(provider = %provider, reason = %reason, "Connectivity check failed");
        }
        outcome
    }

    /// Lets a provider whose circuit is due for recovery prove itself.
    ///
    /// When the recovery timeout has passed, one half-open trial slot is spent
    /// on a connectivity check. Success closes the circuit and starts a fresh
    /// outcome window for the provider; failure reopens the circuit. A circuit
    /// that is closed, still cooling down, or already has a trial outstanding
    /// is left alone.
    ///
    /// # Returns
    /// The circuit state after the attempt.
    pub async fn attempt_circuit_recovery(&self, provider: &str) -> CircuitState {
        if self.breaker.refresh(provider) != CircuitState::HalfOpen || self.breaker.check(provider).is_err() {
            return self.breaker.state(provider);
        }

        let started = Instant::now();
        match self.check_connectivity(provider).await {
            Ok(()) => {
                self.tracker.clear(provider);
                self.tracker.record_success(provider, started.elapsed());
                self.breaker.record_success(provider);
                info!(provider = %provider, "Provider passed recovery check");
            }
            Err(_) => {
                self.tracker.record_failure(provider, started.elapsed());
                self.breaker.record_failure(provider);
            }
        }
        self.breaker.state(provider)
    }

    /// Runs a health check. Probe failures are reported, not returned as errors.
    pub async fn assess(&self, provider: &str) -> HealthReport {
        let connectivity_error = self.check_connectivity(provider).await.err();

        let circuit_state = self.breaker.state(provider);
        let outcomes = self.tracker.stats(provider);
        let rate_limit_utilization = self.limiter.status(provider).utilization;

        let circuit = match circuit_state {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 0.5,
            CircuitState::Open => 0.0,
        };
        let reachable = if connectivity_error.is_none() { 1.0 } else { 0.0 };
        let headroom = 1.0 - (rate_limit_utilization / 100.0).clamp(0.0, 1.0);
        let health_score =
            (0.4 * outcomes.success_rate + 0.25 * circuit + 0.25 * reachable + 0.1 * headroom).clamp(0.0, 1.0);

        let health = if health_score >= 0.8 {
            ProviderHealth::Healthy
        } else if health_score >= 0.5 {
            ProviderHealth::Degraded
        } else {
            ProviderHealth::Unhealthy
        };

        debug!(provider = %provider, health_score, health = ?health, "Provider health assessed");

        HealthReport {
            provider: provider.to_string(),
            circuit_state,
            outcomes,
            connectivity_error,
            rate_limit_utilization,
            health_score,
            health,
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::BreakerSettings;

    struct Unreachable;

    #[async_trait]
    impl ConnectivityProbe for Unreachable {
        async fn probe(&self, provider: &str) -> Result<(), String> {
            Err(format!("{provider}: connection refused"))
        }
    }

    struct Unresponsive;

    #[async_trait]
    impl ConnectivityProbe for Unresponsive {
        async fn probe(&self, _provider: &str) -> Result<(), String> {
            std::future::pending().await
        }
    }

    fn monitor(probe: Arc<dyn ConnectivityProbe>) -> (HealthMonitor, Arc<CircuitBreaker>, Arc<HealthTracker>) {
        let breaker = Arc::new(CircuitBreaker::default());
        let tracker = Arc::new(HealthTracker::default());
        let monitor =
            HealthMonitor::new(Arc::clone(&breaker), Arc::new(RateLimiter::default()), Arc::clone(&tracker), probe);
        (monitor, breaker, tracker)
    }

    #[test]
    fn test_tracker_success_rate() {
        let tracker = HealthTracker::default();
        assert!((tracker.success_rate("p") - 1.0).abs() < f64::EPSILON);

        tracker.record_success("p", Duration::from_millis(100));
        tracker.record_success("p", Duration::from_millis(300));
        tracker.record_failure("p", Duration::from_millis(200));
        tracker.record_failure("p", Duration::from_millis(200));

        let stats = tracker.stats("p");
        assert_eq!(stats.successes, 2);
        assert_eq!(stats.failures, 2);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.avg_latency_ms, Some(200));
    }

    #[test]
    fn test_tracker_window_expires() {
        let tracker = HealthTracker::new(Duration::from_millis(20));
        tracker.record_failure("p", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(40));
        assert!((tracker.success_rate("p") - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_healthy_provider() {
        let (monitor, _, _) = monitor(Arc::new(AlwaysReachable));
        let report = monitor.assess("p").await;
        assert!(report.is_reachable());
        assert_eq!(report.health, ProviderHealth::Healthy);
        assert!((report.health_score - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unreachable_provider_is_reported() {
        let (monitor, _, _) = monitor(Arc::new(Unreachable));
        let report = monitor.assess("p").await;
        assert_eq!(report.connectivity_error.as_deref(), Some("p: connection refused"));
        assert!(report.health_score < 0.8);
    }

    #[tokio::test]
    async fn test_open_circuit_and_failures_degrade() {
        let (monitor, breaker, tracker) = monitor(Arc::new(AlwaysReachable));
        breaker.configure("p", BreakerSettings { failure_threshold: 1, ..BreakerSettings::default() });
        breaker.record_failure("p");
        for _ in 0..4 {
            tracker.record_failure("p", Duration::from_millis(10));
        }

        let report = monitor.assess("p").await;
        assert_eq!(report.circuit_state, CircuitState::Open);
        assert_eq!(report.health, ProviderHealth::Unhealthy);
    }

    #[tokio::test]
    async fn test_hanging_connectivity_check_times_out() {
        let (monitor, _, _) = monitor(Arc::new(Unresponsive));
        let monitor = monitor.with_connectivity_timeout(Duration::from_millis(20));

        let report = tokio::time::timeout(Duration::from_secs(2), monitor.assess("p")).await.unwrap();
        let reason = report.connectivity_error.unwrap();
        assert!(reason.contains("timed out after 20ms"), "{reason}");
    }

    #[tokio::test]
    async fn test_circuit_recovery_closes_after_cooldown() {
        let (monitor, breaker, tracker) = monitor(Arc::new(AlwaysReachable));
        breaker.configure(
            "p",
            BreakerSettings { failure_threshold: 1, recovery_timeout: Duration::from_millis(30), half_open_attempts: 1 },
        );
        breaker.record_failure("p");
        tracker.record_failure("p", Duration::ZERO);

        // still cooling down
        assert_eq!(monitor.attempt_circuit_recovery("p").await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.attempt_circuit_recovery("p").await, CircuitState::Closed);
        assert!((tracker.success_rate("p") - 1.0).abs() < f64::EPSILON);
        assert_eq!(monitor.assess("p").await.health, ProviderHealth::Healthy);
    }

    #[tokio::test]
    async fn test_failed_circuit_recovery_reopens() {
        let (monitor, breaker, _) = monitor(Arc::new(Unreachable));
        breaker.configure(
            "p",
            BreakerSettings { failure_threshold: 1, recovery_timeout: Duration::from_millis(30), half_open_attempts: 1 },
        );
        breaker.record_failure("p");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(monitor.attempt_circuit_recovery("p").await, CircuitState::Open);
    }
}
