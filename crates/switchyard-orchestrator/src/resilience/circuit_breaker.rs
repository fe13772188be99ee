//! Circuit breaker pattern for provider failure detection.
//!
//! Each provider has its own circuit. `Closed` lets requests through and counts
//! consecutive failures; reaching the threshold opens the circuit. After the
//! recovery timeout the next check moves it to `HalfOpen` and grants a bounded
//! number of trial requests. A trial success closes the circuit and a trial
//! failure reopens it. Checks made while every trial is still outstanding are
//! rejected without changing state; trials left unresolved for a whole
//! recovery timeout reopen the circuit.

use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Circuit breaker state for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - normal operation.
    Closed,
    /// Circuit is half-open - probing recovery.
    HalfOpen,
    /// Circuit is open - failing fast until the recovery timeout expires.
    Open,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing.
    pub recovery_timeout: Duration,
    /// Probes allowed while half-open.
    pub half_open_attempts: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 5, recovery_timeout: Duration::from_secs(60), half_open_attempts: 1 }
    }
}

/// Queryable view of one provider's circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Failures since the circuit last closed.
    pub failure_count: u64,
    /// Failures since the last success.
    pub consecutive_failures: u32,
    /// Time of the last failure.
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Time of the last success.
    pub last_success_time: Option<DateTime<Utc>>,
    /// Probes left while half-open.
    pub probes_remaining: u32,
}

#[derive(Debug, Clone)]
struct Circuit {
    settings: BreakerSettings,
    state: CircuitState,
    failure_count: u64,
    consecutive_failures: u32,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    opened_at: Option<Instant>,
    half_open_at: Option<Instant>,
    probes_remaining: u32,
}

impl Circuit {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            state: CircuitState::Closed,
            failure_count: 0,
            consecutive_failures: 0,
            last_failure_time: None,
            last_success_time: None,
            opened_at: None,
            half_open_at: None,
            probes_remaining: 0,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_at = None;
        self.probes_remaining = 0;
    }

    fn half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_at = Some(Instant::now());
        self.probes_remaining = self.settings.half_open_attempts;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.half_open_at = None;
        self.probes_remaining = 0;
    }

    fn elapsed(since: Option<Instant>, timeout: Duration) -> bool {
        since.is_none_or(|at| at.elapsed() >= timeout)
    }

    /// Applies the time-driven transitions.
    fn advance(&mut self) {
        match self.state {
            CircuitState::Open if Self::elapsed(self.opened_at, self.settings.recovery_timeout) => {
                self.half_open();
            }
            CircuitState::HalfOpen
                if self.probes_remaining == 0
                    && Self::elapsed(self.half_open_at, self.settings.recovery_timeout) =>
            {
                self.open();
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failure_count: self.failure_count,
            consecutive_failures: self.consecutive_failures,
            last_failure_time: self.last_failure_time,
            last_success_time: self.last_success_time,
            probes_remaining: self.probes_remaining,
        }
    }
}

/// Circuit breaker for every known provider.
pub struct CircuitBreaker {
    /// Per-provider circuits (thread-safe).
    circuits: RwLock<HashMap<String, Circuit>>,
    /// Settings for providers without explicit configuration.
    defaults: BreakerSettings,
    events: EventBus,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("defaults", &self.defaults)
            .field("provider_count", &self.circuits.try_read().map(|c| c.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Creates a circuit breaker.
    ///
    /// # Arguments
    /// * `defaults` - Settings for providers that were never configured
    /// * `events` - Sink for state transitions
    #[must_use]
    pub fn new(defaults: BreakerSettings, events: EventBus) -> Self {
        Self { circuits: RwLock::new(HashMap::new()), defaults, events }
    }

    fn circuits(&self) -> RwLockWriteGuard<'_, HashMap<String, Circuit>> {
        self.circuits.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets a provider's thresholds. The circuit keeps its current state.
    pub fn configure(&self, provider: &str, settings: BreakerSettings) {
        self.circuits()
            .entry(provider.to_string())
            .and_modify(|c| c.settings = settings)
            .or_insert_with(|| Circuit::new(settings));
    }

    fn update<T>(&self, provider: &str, f: impl FnOnce(&mut Circuit) -> T) -> T {
        let (from, to, result) = {
            let mut circuits = self.circuits();
            let circuit = circuits.entry(provider.to_string()).or_insert_with(|| Circuit::new(self.defaults));
            let from = circuit.state;
            let result = f(circuit);
            (from, circuit.state, result)
        };
        if from != to {
            self.transition(provider, from, to);
        }
        result
    }

    fn transition(&self, provider: &str, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(provider = %provider, from = %from, "Circuit breaker: -> Open"),
            CircuitState::HalfOpen => info!(provider = %provider, from = %from, "Circuit breaker: -> HalfOpen"),
            CircuitState::Closed => info!(provider = %provider, from = %from, "Circuit breaker: -> Closed"),
        }
        self.events.emit(CoreEvent::CircuitTransition { provider: provider.to_string(), from, to });
    }

    /// Gates a request to a provider.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to `HalfOpen`.
    /// Each half-open check takes one trial slot. Once every slot is taken,
    /// further checks are rejected until a trial reports back through
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    ///
    /// # Errors
    /// Returns `OrchestrationError::CircuitOpen` if the request must not be attempted.
    pub fn check(&self, provider: &str) -> Result<()> {
        let allowed = self.update(provider, |circuit| {
            circuit.advance();
            match circuit.state {
                CircuitState::Closed => true,
                CircuitState::HalfOpen if circuit.probes_remaining > 0 => {
                    circuit.probes_remaining -= 1;
                    true
                }
                CircuitState::HalfOpen | CircuitState::Open => false,
            }
        });

        if allowed {
            Ok(())
        } else {
            debug!(provider = %provider, "Circuit open, rejecting request");
            Err(OrchestrationError::CircuitOpen(provider.to_string()))
        }
    }

    /// Records a successful request.
    pub fn record_success(&self, provider: &str) {
        self.update(provider, |circuit| {
            circuit.last_success_time = Some(Utc::now());
            match circuit.state {
                CircuitState::HalfOpen => circuit.close(),
                CircuitState::Closed => circuit.consecutive_failures = 0,
                // Still cooling down
                CircuitState::Open => {}
            }
        });
    }

    /// Records a failed request.
    pub fn record_failure(&self, provider: &str) {
        self.update(provider, |circuit| {
            circuit.failure_count += 1;
            circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
            circuit.last_failure_time = Some(Utc::now());
            match circuit.state {
                CircuitState::Closed if circuit.consecutive_failures >= circuit.settings.failure_threshold => {
                    circuit.open();
                }
                CircuitState::HalfOpen => circuit.open(),
                CircuitState::Closed | CircuitState::Open => {}
            }
        });
    }

    /// Forces a provider's circuit closed with counters zeroed.
    pub fn reset(&self, provider: &str) {
        self.update(provider, Circuit::close);
        info!(provider = %provider, "Circuit breaker reset");
    }

    /// Applies any transition the recovery timeout allows and returns the state.
    ///
    /// Unlike [`check`](Self::check) this never takes a trial slot.
    pub fn refresh(&self, provider: &str) -> CircuitState {
        self.update(provider, |circuit| {
            circuit.advance();
            circuit.state
        })
    }

    /// Gets the current state without triggering transitions.
    pub fn state(&self, provider: &str) -> CircuitState {
        self.snapshot(provider).state
    }

    /// Gets a provider's circuit details.
    pub fn snapshot(&self, provider: &str) -> CircuitSnapshot {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .map_or_else(|| Circuit::new(self.defaults).snapshot(), Circuit::snapshot)
    }

    /// Gets every known circuit.
    pub fn snapshots(&self) -> HashMap<String, CircuitSnapshot> {
        self.circuits
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(provider, circuit)| (provider.clone(), circuit.snapshot()))
            .collect()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(BreakerSettings::default(), EventBus::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn breaker(threshold: u32, recovery_ms: u64, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_millis(recovery_ms),
                half_open_attempts: probes,
            },
            EventBus::default(),
        )
    }

    #[test]
    fn test_unknown_provider_is_closed() {
        let breaker = CircuitBreaker::default();
        assert_eq!(breaker.state("anthropic"), CircuitState::Closed);
        assert!(breaker.check("anthropic").is_ok());
    }

    #[test]
    fn test_circuit_opens_after_consecutive_failures() {
        let breaker = breaker(3, 60_000, 1);
        for _ in 0..2 {
            breaker.record_failure("p");
        }
        assert_eq!(breaker.state("p"), CircuitState::Closed);

        breaker.record_failure("p");
        assert_eq!(breaker.state("p"), CircuitState::Open);
        assert!(matches!(breaker.check("p"), Err(OrchestrationError::CircuitOpen(_))));
    }

    #[test]
    fn test_success_interrupts_failure_streak() {
        let breaker = breaker(3, 60_000, 1);
        breaker.record_failure("p");
        breaker.record_failure("p");
        breaker.record_success("p");
        breaker.record_failure("p");

        let snapshot = breaker.snapshot("p");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.failure_count, 3);
    }

    #[test]
    fn test_circuit_transitions_to_half_open_after_recovery_timeout() {
        let breaker = breaker(1, 100, 1);
        breaker.record_failure("p");
        assert!(breaker.check("p").is_err());

        thread::sleep(Duration::from_millis(150));

        assert!(breaker.check("p").is_ok());
        assert_eq!(breaker.state("p"), CircuitState::HalfOpen);
    }

    #[test]
    fn test_circuit_closes_after_success_in_half_open() {
        let breaker = breaker(2, 100, 1);
        breaker.record_failure("p");
        breaker.record_failure("p");
        thread::sleep(Duration::from_millis(150));
        breaker.check("p").unwrap();

        breaker.record_success("p");

        let snapshot = breaker.snapshot("p");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[test]
    fn test_circuit_reopens_after_failure_in_half_open() {
        let breaker = breaker(1, 100, 1);
        breaker.record_failure("p");
        thread::sleep(Duration::from_millis(150));
        breaker.check("p").unwrap();

        breaker.record_failure("p");
        assert_eq!(breaker.state("p"), CircuitState::Open);
        // Recovery timer restarted
        assert!(breaker.check("p").is_err());
    }

    #[test]
    fn test_extra_checks_wait_for_outstanding_trial() {
        let breaker = breaker(1, 100, 1);
        breaker.record_failure("p");
        thread::sleep(Duration::from_millis(150));

        assert!(breaker.check("p").is_ok());
        assert!(breaker.check("p").is_err());
        assert!(breaker.check("p").is_err());
        assert_eq!(breaker.state("p"), CircuitState::HalfOpen);

        // the outstanding trial still decides the outcome
        breaker.record_success("p");
        assert_eq!(breaker.state("p"), CircuitState::Closed);
        assert!(breaker.check("p").is_ok());
    }

    #[test]
    fn test_concurrent_checks_share_trial_budget() {
        let breaker = Arc::new(breaker(1, 50, 2));
        breaker.record_failure("p");
        thread::sleep(Duration::from_millis(80));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let breaker = Arc::clone(&breaker);
                thread::spawn(move || breaker.check("p").is_ok())
            })
            .collect();
        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();

        assert_eq!(admitted, 2);
        assert_eq!(breaker.state("p"), CircuitState::HalfOpen);

        breaker.record_success("p");
        assert_eq!(breaker.state("p"), CircuitState::Closed);
    }

    #[test]
    fn test_unresolved_trials_reopen_after_timeout() {
        let breaker = breaker(1, 50, 1);
        breaker.record_failure("p");
        thread::sleep(Duration::from_millis(80));
        assert!(breaker.check("p").is_ok());

        thread::sleep(Duration::from_millis(80));
        assert!(breaker.check("p").is_err());
        assert_eq!(breaker.state("p"), CircuitState::Open);
    }

    #[test]
    fn test_refresh_moves_to_half_open_without_taking_a_trial() {
        let breaker = breaker(1, 50, 1);
        breaker.record_failure("p");
        assert_eq!(breaker.refresh("p"), CircuitState::Open);

        thread::sleep(Duration::from_millis(80));
        assert_eq!(breaker.refresh("p"), CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot("p").probes_remaining, 1);
        assert!(breaker.check("p").is_ok());
    }

    #[test]
    fn test_manual_reset() {
        let breaker = breaker(1, 60_000, 1);
        breaker.record_failure("p");
        assert_eq!(breaker.state("p"), CircuitState::Open);

        breaker.reset("p");
        let snapshot = breaker.snapshot("p");
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.failure_count, 0);
        assert!(breaker.check("p").is_ok());
    }

    #[test]
    fn test_configure_per_provider() {
        let breaker = breaker(5, 60_000, 1);
        breaker.configure("fragile", BreakerSettings { failure_threshold: 1, ..BreakerSettings::default() });
        breaker.record_failure("fragile");
        breaker.record_failure("sturdy");
        assert_eq!(breaker.state("fragile"), CircuitState::Open);
        assert_eq!(breaker.state("sturdy"), CircuitState::Closed);
        assert_eq!(breaker.snapshots().len(), 2);
    }

    #[test]
    fn test_transitions_are_emitted() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let breaker = CircuitBreaker::new(BreakerSettings { failure_threshold: 1, ..BreakerSettings::default() }, events);

        breaker.record_failure("p");
        assert_eq!(
            rx.try_recv().unwrap(),
            CoreEvent::CircuitTransition {
                provider: "p".into(),
                from: CircuitState::Closed,
                to: CircuitState::Open,
            }
        );
    }
}
