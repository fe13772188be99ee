//! Engine supervision: start, stop and restart engine pools, replace crashed
//! workers under a restart budget, and run periodic health checks.

use crate::config::{ExecutionSettings, SupervisionSettings};
use crate::error::{OrchestrationError, Result};
use crate::events::CoreEvent;
use crate::lifecycle::{EngineLifecycle, EngineStatus, HealthStatus};
use crate::pool::{EnginePool, PoolCounters, PoolStatus};
use crate::registry::EngineConfig;
use crate::server::ExecutionContext;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use switchyard_abstraction::EngineInput;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Sliding restart budget: at most `max_restarts` restarts per `window`.
#[derive(Debug, Clone)]
pub struct RestartIntensity {
    max_restarts: usize,
    window: Duration,
    history: VecDeque<Instant>,
}

impl RestartIntensity {
    /// Creates an empty budget.
    #[must_use]
    pub fn new(max_restarts: usize, window: Duration) -> Self {
        Self { max_restarts, window, history: VecDeque::new() }
    }

    /// Records a restart attempt.
    ///
    /// # Returns
    /// `Ok` with the restarts inside the window if the budget allows it,
    /// `Err` with the attempted count if the budget is exhausted.
    pub fn record(&mut self) -> std::result::Result<usize, usize> {
        let now = Instant::now();
        while self.history.front().is_some_and(|t| now.duration_since(*t) > self.window) {
            self.history.pop_front();
        }
        if self.history.len() >= self.max_restarts {
            return Err(self.history.len() + 1);
        }
        self.history.push_back(now);
        Ok(self.history.len())
    }

    /// Forgets recorded restarts.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

/// Supervisor for every running engine pool.
pub struct EngineSupervisor {
    pools: RwLock<HashMap<String, Arc<EnginePool>>>,
    monitors: Mutex<HashMap<String, CancellationToken>>,
    restarts: Mutex<HashMap<String, RestartIntensity>>,
    lifecycle: Arc<EngineLifecycle>,
    ctx: ExecutionContext,
    execution: ExecutionSettings,
    supervision: SupervisionSettings,
    shutdown: CancellationToken,
}

impl fmt::Debug for EngineSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSupervisor")
            .field("pool_count", &self.pools.try_read().map(|p| p.len()).unwrap_or(0))
            .field("supervision", &self.supervision)
            .finish_non_exhaustive()
    }
}

impl EngineSupervisor {
    /// Creates a supervisor.
    ///
    /// # Arguments
    /// * `lifecycle` - Shared engine status directory
    /// * `ctx` - Task registry and event bus handed to every execution
    /// * `execution` - Checkout timeout and health-check interval
    /// * `supervision` - Restart budget
    /// * `shutdown` - Parent token of every background health loop
    #[must_use]
    pub fn new(
        lifecycle: Arc<EngineLifecycle>,
        ctx: ExecutionContext,
        execution: ExecutionSettings,
        supervision: SupervisionSettings,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            pools: RwLock::new(HashMap::new()),
            monitors: Mutex::new(HashMap::new()),
            restarts: Mutex::new(HashMap::new()),
            lifecycle,
            ctx,
            execution,
            supervision,
            shutdown,
        }
    }

    fn monitors(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.monitors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn restarts(&self) -> MutexGuard<'_, HashMap<String, RestartIntensity>> {
        self.restarts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the pool for an engine and its health-check loop.
    ///
    /// # Errors
    /// Returns `AlreadyRunning` if a pool exists, or `InitFailed` if a worker
    /// fails to initialize; the engine is then marked `Error`.
    pub async fn start_engine(self: &Arc<Self>, config: Arc<EngineConfig>) -> Result<()> {
        let name = config.name.clone();
        if self.pools.read().await.contains_key(&name) {
            return Err(OrchestrationError::AlreadyRunning(name));
        }

        // Initializing is reachable from every status, so this never fails
        let _ = self.lifecycle.mark_initializing(&name).await;

        let pool = match EnginePool::start(config, self.execution.checkout_timeout(), self.ctx.events.clone()).await {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                error!(engine = %name, error = %e, "Engine failed to start");
                let _ = self.lifecycle.mark_error(&name).await;
                return Err(e);
            }
        };

        {
            let mut pools = self.pools.write().await;
            if pools.contains_key(&name) {
                pool.close();
                return Err(OrchestrationError::AlreadyRunning(name));
            }
            pools.insert(name.clone(), Arc::clone(&pool));
        }

        self.restarts().insert(
            name.clone(),
            RestartIntensity::new(self.supervision.max_restarts, self.supervision.restart_window()),
        );
        let _ = self.lifecycle.mark_ready(&name).await;
        self.spawn_health_loop(&name, pool);

        info!(engine = %name, "Engine started");
        Ok(())
    }

    /// Stops an engine: cancels its health loop, closes its pool and marks it stopped.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running.
    pub async fn stop_engine(&self, name: &str) -> Result<()> {
        let pool = self
            .pools
            .write()
            .await
            .remove(name)
            .ok_or_else(|| OrchestrationError::PoolNotFound(name.to_string()))?;

        if let Some(monitor) = self.monitors().remove(name) {
            monitor.cancel();
        }
        self.restarts().remove(name);
        pool.close();
        let _ = self.lifecycle.mark_stopped(name).await;

        info!(engine = %name, "Engine stopped");
        Ok(())
    }

    /// Stops and starts an engine with the same descriptor, clearing its restart budget.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running, or the start error.
    pub async fn restart_engine(self: &Arc<Self>, name: &str) -> Result<()> {
        let config = self
            .pool(name)
            .await
            .map(|pool| Arc::clone(pool.config()))
            .ok_or_else(|| OrchestrationError::PoolNotFound(name.to_string()))?;
        self.stop_engine(name).await?;
        self.start_engine(config).await
    }

    /// Executes a request on an engine's pool.
    ///
    /// A crash discards the worker and triggers a supervised replacement.
    /// Requests turned away before reaching a worker emit
    /// [`CoreEvent::ExecutionRejected`].
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running, `EngineFailed` if it
    /// exhausted its restart budget, or the pool's execution error.
    pub async fn execute(&self, name: &str, input: EngineInput, timeout: Duration) -> Result<Value> {
        let Some(pool) = self.pool(name).await else {
            return Err(self.reject(name, OrchestrationError::PoolNotFound(name.to_string())));
        };

        if self.lifecycle.get_status(name).await == Some(EngineStatus::Error) {
            return Err(self.reject(
                name,
                OrchestrationError::EngineFailed {
                    engine: name.to_string(),
                    reason: "restart budget exhausted".to_string(),
                },
            ));
        }

        let outcome = pool.execute(input, timeout, &self.ctx).await;
        if let Err(OrchestrationError::Crash(reason)) = &outcome {
            self.handle_crash(name, &pool, reason).await;
        }
        outcome
    }

    fn reject(&self, name: &str, err: OrchestrationError) -> OrchestrationError {
        debug!(engine = %name, error = %err, "Execution rejected");
        self.ctx.events.emit(CoreEvent::ExecutionRejected { target: name.to_string(), reason: err.to_string() });
        err
    }

    /// Replaces a crashed worker. The engine keeps its lifecycle status while
    /// the pool refills; only an exhausted budget or a failed replacement
    /// changes it, to `Error`.
    async fn handle_crash(&self, name: &str, pool: &EnginePool, reason: &str) {
        let decision = self
            .restarts()
            .entry(name.to_string())
            .or_insert_with(|| RestartIntensity::new(self.supervision.max_restarts, self.supervision.restart_window()))
            .record();

        let restarts_in_window = match decision {
            Ok(count) => count,
            Err(attempted) => {
                self.escalate(
                    name,
                    format!(
                        "{attempted} crashes within {}ms, last: {reason}",
                        self.supervision.restart_window_ms
                    ),
                )
                .await;
                return;
            }
        };

        warn!(engine = %name, restarts_in_window, reason = %reason, "Restarting crashed worker");
        match pool.replenish().await {
            Ok(_) => {
                self.ctx.events.emit(CoreEvent::EngineRestarted { engine: name.to_string(), restarts_in_window });
            }
            Err(e) => self.escalate(name, e.to_string()).await,
        }
    }

    async fn escalate(&self, name: &str, reason: String) {
        error!(engine = %name, reason = %reason, "Engine restart budget exhausted");
        let _ = self.lifecycle.mark_error(name).await;
        self.ctx.events.emit(CoreEvent::EngineFailed { engine: name.to_string(), reason });
    }

    fn spawn_health_loop(&self, name: &str, pool: Arc<EnginePool>) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.monitors().insert(name.to_string(), token.clone()) {
            previous.cancel();
        }

        let lifecycle = Arc::clone(&self.lifecycle);
        let interval = self.execution.health_check_interval();
        let engine = name.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let status = lifecycle.get_status(&engine).await.unwrap_or(EngineStatus::Stopped);
                        let health = pool.health_check(status);
                        debug!(engine = %engine, health = ?health, "Health check");
                    }
                    () = token.cancelled() => {
                        debug!(engine = %engine, "Health loop stopped");
                        break;
                    }
                }
            }
        });
    }

    /// Runs a health check now.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running.
    pub async fn health_check(&self, name: &str) -> Result<HealthStatus> {
        let pool = self.pool(name).await.ok_or_else(|| OrchestrationError::PoolNotFound(name.to_string()))?;
        let status = self.lifecycle.get_status(name).await.unwrap_or(EngineStatus::Stopped);
        Ok(pool.health_check(status))
    }

    /// Returns the pool of a running engine.
    pub async fn pool(&self, name: &str) -> Option<Arc<EnginePool>> {
        self.pools.read().await.get(name).cloned()
    }

    /// Returns the utilization of a running engine's pool.
    pub async fn pool_status(&self, name: &str) -> Option<PoolStatus> {
        self.pool(name).await.map(|pool| pool.status())
    }

    /// Returns the request counters of a running engine.
    pub async fn counters(&self, name: &str) -> Option<PoolCounters> {
        self.pool(name).await.map(|pool| pool.counters())
    }

    /// Names of running engines, sorted.
    pub async fn running_engines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stops every running engine.
    pub async fn stop_all(&self) {
        for name in self.running_engines().await {
            if let Err(e) = self.stop_engine(&name).await {
                warn!(engine = %name, error = %e, "Failed to stop engine");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::tasks::TaskRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use switchyard_abstraction::{Engine, EngineError, EngineResult, EngineState};

    struct FlakyEngine;

    #[async_trait]
    impl Engine for FlakyEngine {
        async fn init(&self, config: &Value) -> EngineResult<EngineState> {
            if config["refuse"] == true {
                return Err(EngineError::Init("no credentials".into()));
            }
            Ok(EngineState::new(config.clone()))
        }

        async fn execute(&self, input: EngineInput, _state: &EngineState) -> EngineResult<Value> {
            assert!(input.payload != json!("crash"), "worker crashed");
            Ok(input.payload)
        }
    }

    fn supervisor(max_restarts: usize) -> (Arc<EngineSupervisor>, Arc<EngineLifecycle>, EventBus) {
        let events = EventBus::default();
        let lifecycle = Arc::new(EngineLifecycle::new());
        let ctx = ExecutionContext {
            tasks: Arc::new(TaskRegistry::new(events.clone(), Duration::from_secs(60))),
            events: events.clone(),
        };
        let supervision = SupervisionSettings { max_restarts, restart_window_ms: 5_000 };
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::clone(&lifecycle),
            ctx,
            ExecutionSettings::default(),
            supervision,
            CancellationToken::new(),
        ));
        (supervisor, lifecycle, events)
    }

    /// Initializes instantly the first time and slowly afterwards.
    #[derive(Default)]
    struct SlowRestartEngine {
        inits: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Engine for SlowRestartEngine {
        async fn init(&self, config: &Value) -> EngineResult<EngineState> {
            if self.inits.fetch_add(1, std::sync::atomic::Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(EngineState::new(config.clone()))
        }

        async fn execute(&self, input: EngineInput, _state: &EngineState) -> EngineResult<Value> {
            assert!(input.payload != json!("crash"), "worker crashed");
            Ok(input.payload)
        }
    }

    fn flaky() -> Arc<EngineConfig> {
        Arc::new(EngineConfig::new("flaky", Arc::new(FlakyEngine)))
    }

    #[test]
    fn test_restart_intensity_budget() {
        let mut intensity = RestartIntensity::new(2, Duration::from_secs(5));
        assert_eq!(intensity.record(), Ok(1));
        assert_eq!(intensity.record(), Ok(2));
        assert_eq!(intensity.record(), Err(3));
        intensity.reset();
        assert_eq!(intensity.record(), Ok(1));
    }

    #[test]
    fn test_restart_intensity_window_expires() {
        let mut intensity = RestartIntensity::new(1, Duration::from_millis(10));
        assert_eq!(intensity.record(), Ok(1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(intensity.record(), Ok(1));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (supervisor, lifecycle, _) = supervisor(3);
        supervisor.start_engine(flaky()).await.unwrap();
        assert!(lifecycle.is_alive("flaky").await);
        assert!(matches!(
            supervisor.start_engine(flaky()).await,
            Err(OrchestrationError::AlreadyRunning(_))
        ));

        supervisor.stop_engine("flaky").await.unwrap();
        assert_eq!(lifecycle.get_status("flaky").await, Some(EngineStatus::Stopped));
        assert!(matches!(
            supervisor.execute("flaky", EngineInput::new(json!(1)), Duration::from_secs(1)).await,
            Err(OrchestrationError::PoolNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_init_failure_is_surfaced() {
        let (supervisor, lifecycle, _) = supervisor(3);
        let config = Arc::new(EngineConfig::new("flaky", Arc::new(FlakyEngine)).with_config(json!({"refuse": true})));
        let err = supervisor.start_engine(config).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InitFailed { .. }));
        assert_eq!(lifecycle.get_status("flaky").await, Some(EngineStatus::Error));
        assert!(supervisor.running_engines().await.is_empty());
    }

    #[tokio::test]
    async fn test_crash_restarts_worker() {
        let (supervisor, lifecycle, events) = supervisor(3);
        let mut rx = events.subscribe();
        supervisor.start_engine(flaky()).await.unwrap();

        let result = supervisor.execute("flaky", EngineInput::new(json!("crash")), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(OrchestrationError::Crash(_))));
        assert!(lifecycle.is_alive("flaky").await);
        assert_eq!(supervisor.pool_status("flaky").await.unwrap().available, 1);

        let ok = supervisor.execute("flaky", EngineInput::new(json!("fine")), Duration::from_secs(1)).await;
        assert_eq!(ok.unwrap(), json!("fine"));

        let mut restarted = false;
        while let Ok(event) = rx.try_recv() {
            restarted |= matches!(event, CoreEvent::EngineRestarted { restarts_in_window: 1, .. });
        }
        assert!(restarted);
    }

    #[tokio::test]
    async fn test_restart_budget_escalates() {
        let (supervisor, lifecycle, events) = supervisor(1);
        let mut rx = events.subscribe();
        supervisor.start_engine(flaky()).await.unwrap();

        for _ in 0..2 {
            let _ = supervisor.execute("flaky", EngineInput::new(json!("crash")), Duration::from_secs(1)).await;
        }

        assert_eq!(lifecycle.get_status("flaky").await, Some(EngineStatus::Error));
        assert!(matches!(
            supervisor.execute("flaky", EngineInput::new(json!(1)), Duration::from_secs(1)).await,
            Err(OrchestrationError::EngineFailed { .. })
        ));

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            failed |= matches!(event, CoreEvent::EngineFailed { .. });
        }
        assert!(failed);

        supervisor.restart_engine("flaky").await.unwrap();
        assert!(lifecycle.is_alive("flaky").await);
    }

    #[tokio::test]
    async fn test_health_check_reports_status() {
        let (supervisor, _, _) = supervisor(3);
        supervisor.start_engine(flaky()).await.unwrap();
        assert_eq!(supervisor.health_check("flaky").await.unwrap(), HealthStatus::Healthy);
        assert!(supervisor.pool("flaky").await.unwrap().last_health_check().is_some());
    }

    #[tokio::test]
    async fn test_periodic_health_loop_emits() {
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let ctx = ExecutionContext {
            tasks: Arc::new(TaskRegistry::new(events.clone(), Duration::from_secs(60))),
            events,
        };
        let execution = ExecutionSettings { health_check_interval_ms: 20, ..ExecutionSettings::default() };
        let shutdown = CancellationToken::new();
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::new(EngineLifecycle::new()),
            ctx,
            execution,
            SupervisionSettings::default(),
            shutdown.clone(),
        ));
        supervisor.start_engine(flaky()).await.unwrap();

        let health = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if let Ok(CoreEvent::HealthCheck { health, .. }) = rx.recv().await {
                    return health;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(health, HealthStatus::Healthy);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_engine_stays_ready_while_worker_is_replaced() {
        let (supervisor, lifecycle, _) = supervisor(3);
        let config = Arc::new(EngineConfig::new("slow", Arc::new(SlowRestartEngine::default())).with_pool_size(2));
        supervisor.start_engine(config).await.unwrap();

        let crashing = {
            let supervisor = Arc::clone(&supervisor);
            tokio::spawn(async move {
                supervisor.execute("slow", EngineInput::new(json!("crash")), Duration::from_secs(1)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(40)).await;

        // replacement still initializing
        assert_eq!(lifecycle.get_status("slow").await, Some(EngineStatus::Ready));
        assert!(lifecycle.is_alive("slow").await);
        let served = supervisor.execute("slow", EngineInput::new(json!("ok")), Duration::from_secs(1)).await;
        assert_eq!(served.unwrap(), json!("ok"));

        assert!(matches!(crashing.await.unwrap(), Err(OrchestrationError::Crash(_))));
        assert_eq!(supervisor.pool_status("slow").await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_worker_replacement_keeps_error_status() {
        let (supervisor, lifecycle, _) = supervisor(3);
        supervisor.start_engine(flaky()).await.unwrap();
        let pool = supervisor.pool("flaky").await.unwrap();

        // an escalation lands while a replacement is under way
        lifecycle.mark_error("flaky").await.unwrap();
        supervisor.handle_crash("flaky", &pool, "worker crashed").await;

        assert_eq!(lifecycle.get_status("flaky").await, Some(EngineStatus::Error));
        assert!(matches!(
            supervisor.execute("flaky", EngineInput::new(json!(1)), Duration::from_secs(1)).await,
            Err(OrchestrationError::EngineFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_rejections_are_emitted() {
        let (supervisor, _, events) = supervisor(3);
        let mut rx = events.subscribe();

        let err = supervisor.execute("missing", EngineInput::new(json!(1)), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::PoolNotFound(_)));
        assert!(matches!(
            rx.recv().await.unwrap(),
            CoreEvent::ExecutionRejected { target, .. } if target == "missing"
        ));
    }
}
