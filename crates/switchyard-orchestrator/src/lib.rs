//! Engine and provider orchestration core.
//!
//! Routes requests to pluggable engines by capability, runs them on supervised
//! worker pools under a timeout and cancellation watch, tracks in-flight tasks,
//! and guards upstream provider calls with rate limiting, circuit breaking and
//! failover.
//!
//! The [`Orchestrator`] ties the pieces together and is the surface hosts call.

pub mod config;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod resilience;
pub mod selector;
pub mod server;
pub mod supervisor;
pub mod tasks;
pub mod telemetry;

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use switchyard_abstraction::{Engine, EngineInput};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use config::{ConfigError, OrchestratorConfig};
pub use error::{OrchestrationError, Result};
pub use events::{CoreEvent, EventBus, ExecutionStatus};
pub use lifecycle::{EngineLifecycle, EngineStatus, HealthStatus};
pub use pool::{EnginePool, PoolCounters, PoolStatus};
pub use registry::{CapabilityRegistry, EngineConfig, EngineMetadata};
pub use resilience::{
    AlwaysReachable, CallError, CircuitState, ConnectivityProbe, LimitChange, PriorityProfile, ProviderInfo,
    Resilience,
};
pub use selector::{EngineSelector, SelectionStrategy};
pub use server::{EngineRuntimeState, EngineWorker, ExecutionContext};
pub use supervisor::EngineSupervisor;
pub use tasks::{TaskInfo, TaskRegistry, TaskStats, TaskStatus};

/// Options for capability-based execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// How to pick among engines advertising the capability.
    pub strategy: SelectionStrategy,
    /// Execution timeout; engine and orchestrator defaults apply when `None`.
    pub timeout: Option<Duration>,
}

impl ExecuteOptions {
    /// Options with the given strategy.
    #[must_use]
    pub fn with_strategy(strategy: SelectionStrategy) -> Self {
        Self { strategy, timeout: None }
    }

    /// Sets the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Per-engine statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Lifecycle status; `None` if the engine was never started.
    pub status: Option<EngineStatus>,
    /// Pool utilization while running.
    pub pool: Option<PoolStatus>,
    /// Request counters while running.
    pub counters: Option<PoolCounters>,
}

/// Aggregate orchestrator statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrchestratorStats {
    /// Registered engines.
    pub total_engines: usize,
    /// Engines with a running pool.
    pub running_engines: usize,
    /// Requests across running engines.
    pub total_requests: u64,
    /// Errors across running engines.
    pub total_errors: u64,
    /// Statistics per registered engine.
    pub engines: BTreeMap<String, EngineStats>,
    /// Engines per capability.
    pub capabilities: BTreeMap<String, usize>,
    /// Task registry statistics.
    pub tasks: TaskStats,
}

/// Orchestration facade.
pub struct Orchestrator {
    config: OrchestratorConfig,
    lifecycle: Arc<EngineLifecycle>,
    registry: CapabilityRegistry,
    tasks: Arc<TaskRegistry>,
    supervisor: Arc<EngineSupervisor>,
    selector: EngineSelector,
    resilience: Arc<Resilience>,
    events: EventBus,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes changes to the set of registered and running engines.
    membership: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("registry", &self.registry)
            .field("supervisor", &self.supervisor)
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator whose providers are always considered reachable.
    ///
    /// Must be called within a Tokio runtime; background loops are spawned here.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid.
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        Self::with_probe(config, Arc::new(AlwaysReachable))
    }

    /// Creates an orchestrator using `probe` for provider connectivity checks.
    ///
    /// Starts the task sweeper and, when enabled, the failover recovery monitor.
    ///
    /// # Errors
    /// Returns `Config` if the configuration is invalid.
    pub fn with_probe(config: OrchestratorConfig, probe: Arc<dyn ConnectivityProbe>) -> Result<Self> {
        config.validate()?;

        let events = EventBus::default();
        let shutdown = CancellationToken::new();
        let lifecycle = Arc::new(EngineLifecycle::new());
        let registry = CapabilityRegistry::new(Arc::clone(&lifecycle));
        let tasks = Arc::new(TaskRegistry::new(events.clone(), config.tasks.retention()));
        let ctx = ExecutionContext { tasks: Arc::clone(&tasks), events: events.clone() };
        let supervisor = Arc::new(EngineSupervisor::new(
            Arc::clone(&lifecycle),
            ctx,
            config.execution.clone(),
            config.supervision.clone(),
            shutdown.clone(),
        ));
        let resilience = Arc::new(Resilience::new(&config, probe, &events));

        let mut background = vec![tasks.spawn_sweeper(config.tasks.sweep_interval(), shutdown.clone())];
        if config.failover.auto_recovery {
            background.push(resilience.spawn_recovery_monitor(config.failover.monitor_interval(), shutdown.clone()));
        }

        info!(providers = config.providers.len(), declared_engines = config.engines.len(), "Orchestrator started");

        Ok(Self {
            config,
            lifecycle,
            registry,
            tasks,
            supervisor,
            selector: EngineSelector::new(),
            resilience,
            events,
            shutdown,
            background: Mutex::new(background),
            membership: tokio::sync::Mutex::new(()),
        })
    }

    /// Configuration in use.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Provider resilience layer.
    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    /// Task registry.
    pub fn tasks(&self) -> &Arc<TaskRegistry> {
        &self.tasks
    }

    /// Subscribes to core events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.events.subscribe()
    }

    /// Registers an engine and starts its pool.
    ///
    /// Concurrent registrations of the same name are serialized; exactly one
    /// of them starts the pool and the others fail without touching it.
    ///
    /// # Errors
    /// Returns `InitFailed` if a worker fails to initialize; the engine is then
    /// unregistered. Returns `AlreadyRunning` if a pool with that name exists.
    pub async fn register_engine(&self, config: EngineConfig) -> Result<()> {
        let _membership = self.membership.lock().await;
        let name = config.name.clone();
        if self.supervisor.pool(&name).await.is_some() {
            return Err(OrchestrationError::AlreadyRunning(name));
        }

        self.registry.register(config).await;
        let Some(config) = self.registry.get(&name).await else {
            return Err(OrchestrationError::EngineNotFound(name));
        };

        if let Err(e) = self.supervisor.start_engine(config).await {
            warn!(engine = %name, error = %e, "Engine failed to start");
            self.registry.unregister(&name).await;
            self.lifecycle.remove(&name).await;
            return Err(e);
        }
        info!(engine = %name, "Engine registered");
        Ok(())
    }

    /// Registers an engine declared in the configuration with its implementation.
    ///
    /// # Errors
    /// Returns `EngineNotFound` if no `[[engines]]` entry has that name, or the
    /// [`Orchestrator::register_engine`] error.
    pub async fn register_declared(&self, name: &str, handler: Arc<dyn Engine>) -> Result<()> {
        let settings =
            self.config.engine(name).ok_or_else(|| OrchestrationError::EngineNotFound(name.to_string()))?;
        self.register_engine(EngineConfig::from_settings(settings, handler)).await
    }

    /// Stops an engine and removes it from the registry.
    ///
    /// # Errors
    /// Returns `EngineNotFound` if the engine is not registered.
    pub async fn unregister_engine(&self, name: &str) -> Result<()> {
        let _membership = self.membership.lock().await;
        if !self.registry.is_registered(name).await {
            return Err(OrchestrationError::EngineNotFound(name.to_string()));
        }
        match self.supervisor.stop_engine(name).await {
            Ok(()) | Err(OrchestrationError::PoolNotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.registry.unregister(name).await;
        self.lifecycle.remove(name).await;
        Ok(())
    }

    /// Starts a registered engine that was stopped.
    ///
    /// # Errors
    /// Returns `EngineNotFound`, `AlreadyRunning` or `InitFailed`.
    pub async fn start_engine(&self, name: &str) -> Result<()> {
        let _membership = self.membership.lock().await;
        let config = self.registry.get(name).await.ok_or_else(|| OrchestrationError::EngineNotFound(name.to_string()))?;
        self.supervisor.start_engine(config).await
    }

    /// Stops an engine without unregistering it.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running.
    pub async fn stop_engine(&self, name: &str) -> Result<()> {
        self.supervisor.stop_engine(name).await
    }

    /// Restarts an engine with a fresh pool and restart budget.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if the engine is not running, or the start error.
    pub async fn restart_engine(&self, name: &str) -> Result<()> {
        let _membership = self.membership.lock().await;
        self.supervisor.restart_engine(name).await
    }

    /// Executes a request on a named engine.
    ///
    /// The timeout is the first of `timeout`, the engine's own timeout and the
    /// configured default.
    ///
    /// # Errors
    /// Returns `PoolNotFound` if no such engine is running, `CheckoutTimeout`
    /// if no worker frees up in time, or the execution error.
    pub async fn execute(&self, engine: &str, input: EngineInput, timeout: Option<Duration>) -> Result<Value> {
        let engine_timeout = self.registry.get(engine).await.and_then(|c| c.timeout);
        let timeout = timeout.or(engine_timeout).unwrap_or_else(|| self.config.execution.default_timeout());
        debug!(engine = %engine, timeout_ms = timeout.as_millis(), "Executing");
        self.supervisor.execute(engine, input, timeout).await
    }

    /// Executes a request on a live engine advertising `capability`.
    ///
    /// A request no live engine can serve emits [`CoreEvent::ExecutionRejected`].
    ///
    /// # Errors
    /// Returns `NoEngineWithCapability` if no live engine advertises it, or the
    /// [`Orchestrator::execute`] error.
    pub async fn execute_by_capability(
        &self,
        capability: &str,
        input: EngineInput,
        options: ExecuteOptions,
    ) -> Result<Value> {
        let candidates = self.registry.find_by_capability(capability).await;
        let Some(engine) = self.selector.select(capability, &candidates, options.strategy) else {
            let err = OrchestrationError::NoEngineWithCapability(capability.to_string());
            debug!(capability = %capability, "No live engine for capability");
            self.events.emit(CoreEvent::ExecutionRejected { target: capability.to_string(), reason: err.to_string() });
            return Err(err);
        };
        self.execute(&engine.name, input, options.timeout).await
    }

    /// Lifecycle status of an engine.
    ///
    /// # Errors
    /// Returns `EngineNotFound` if the engine was never started.
    pub async fn status(&self, engine: &str) -> Result<EngineStatus> {
        self.lifecycle.get_status(engine).await.ok_or_else(|| OrchestrationError::EngineNotFound(engine.to_string()))
    }

    /// Runs a health check on an engine.
    ///
    /// Engines that are registered but not running report the health of their
    /// lifecycle status.
    ///
    /// # Errors
    /// Returns `EngineNotFound` if the engine is unknown.
    pub async fn health_status(&self, engine: &str) -> Result<HealthStatus> {
        match self.supervisor.health_check(engine).await {
            Ok(health) => Ok(health),
            Err(OrchestrationError::PoolNotFound(_)) => self.status(engine).await.map(|s| s.health()),
            Err(e) => Err(e),
        }
    }

    /// Lists registered engines.
    pub async fn list_engines(&self) -> Vec<EngineMetadata> {
        self.registry.list_engines().await
    }

    /// Lists capabilities with at least one registered engine.
    pub async fn list_capabilities(&self) -> Vec<String> {
        self.registry.list_capabilities().await
    }

    /// Aggregates engine, pool and task statistics.
    pub async fn stats(&self) -> OrchestratorStats {
        let statuses = self.lifecycle.snapshot().await;
        let mut engines = BTreeMap::new();
        let (mut total_requests, mut total_errors, mut running_engines) = (0, 0, 0);

        for metadata in self.registry.list_engines().await {
            let pool = self.supervisor.pool(&metadata.name).await;
            let counters = pool.as_ref().map(|p| p.counters());
            if let Some(c) = counters {
                total_requests += c.requests;
                total_errors += c.errors;
                running_engines += 1;
            }
            engines.insert(
                metadata.name.clone(),
                EngineStats {
                    status: statuses.get(&metadata.name).copied(),
                    pool: pool.as_ref().map(|p| p.status()),
                    counters,
                },
            );
        }

        OrchestratorStats {
            total_engines: engines.len(),
            running_engines,
            total_requests,
            total_errors,
            engines,
            capabilities: self.registry.capability_counts().await,
            tasks: self.tasks.get_stats(),
        }
    }

    /// Cancels an in-flight task.
    ///
    /// # Errors
    /// Returns `TaskNotFound` if the task is not registered.
    pub fn cancel_task(&self, task_id: &str) -> Result<()> {
        self.tasks.cancel_task(task_id)
    }

    /// Cancels every task of a conversation, returning how many were cancelled.
    pub fn cancel_conversation_tasks(&self, conversation_id: &str) -> usize {
        self.tasks.cancel_conversation_tasks(conversation_id)
    }

    /// Tasks of a conversation.
    pub fn find_tasks_by_conversation(&self, conversation_id: &str) -> Vec<TaskInfo> {
        self.tasks.find_by_conversation(conversation_id)
    }

    /// Stops background loops and every engine.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        self.shutdown.cancel();
        self.supervisor.stop_all().await;

        let handles: Vec<JoinHandle<()>> =
            self.background.lock().unwrap_or_else(PoisonError::into_inner).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background loop ended abnormally");
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
