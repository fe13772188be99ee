//! Per-worker execution server.
//!
//! A worker owns the state its engine produced in `init` and runs one request at
//! a time as an independently abortable task, bounded by a hard timeout and
//! watched by the request's cancellation token.

use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus, ExecutionStatus};
use crate::lifecycle::{EngineStatus, HealthStatus};
use crate::registry::EngineConfig;
use crate::tasks::{TaskHandle, TaskRegistry};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use switchyard_abstraction::{CancellationToken, EngineError, EngineInput, EngineState};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Runtime state of a single worker. Only the owning worker mutates it.
#[derive(Debug)]
pub struct EngineRuntimeState {
    /// Worker status.
    pub status: EngineStatus,
    /// When the worker finished `init`.
    pub started_at: DateTime<Utc>,
    /// Requests that reached the engine.
    pub request_count: u64,
    /// Requests that ended in an error, crash or timeout.
    pub error_count: u64,
    /// Last health check performed on this worker.
    pub last_health_check: Option<DateTime<Utc>>,
    /// In-flight task ids and the handles that abort them.
    pub active_tasks: HashMap<String, AbortHandle>,
}

impl EngineRuntimeState {
    fn new() -> Self {
        Self {
            status: EngineStatus::Initializing,
            started_at: Utc::now(),
            request_count: 0,
            error_count: 0,
            last_health_check: None,
            active_tasks: HashMap::new(),
        }
    }
}

/// Shared collaborators of an execution.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Registry that tracks conversation-bound tasks.
    pub tasks: Arc<TaskRegistry>,
    /// Event sink.
    pub events: EventBus,
}

/// Stops the engine task and forgets its registry entry once the execution
/// ends, including when the caller drops the execution early.
struct InFlight {
    abort: AbortHandle,
    tasks: Arc<TaskRegistry>,
    task_id: Option<String>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.abort.abort();
        if let Some(id) = &self.task_id {
            self.tasks.unregister(id);
        }
    }
}

/// A warm worker for one engine.
#[derive(Debug)]
pub struct EngineWorker {
    id: usize,
    config: Arc<EngineConfig>,
    state: Arc<EngineState>,
    runtime: EngineRuntimeState,
}

impl EngineWorker {
    /// Starts a worker by running the engine's `init`.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InitFailed` if `init` fails.
    pub async fn start(id: usize, config: Arc<EngineConfig>) -> Result<Self> {
        let mut runtime = EngineRuntimeState::new();
        let state = config.handler.init(&config.config).await.map_err(|source| {
            error!(engine = %config.name, worker = id, error = %source, "Engine init failed");
            OrchestrationError::InitFailed { engine: config.name.clone(), source }
        })?;

        runtime.status = EngineStatus::Ready;
        runtime.started_at = Utc::now();
        debug!(engine = %config.name, worker = id, "Worker started");

        Ok(Self { id, config, state: Arc::new(state), runtime })
    }

    /// Worker id, unique within its pool.
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Engine name.
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.config.name
    }

    /// Runtime counters and status.
    #[must_use]
    pub fn runtime(&self) -> &EngineRuntimeState {
        &self.runtime
    }

    /// Self-check based on the worker's current status.
    pub fn health_check(&mut self) -> HealthStatus {
        self.runtime.last_health_check = Some(Utc::now());
        self.runtime.status.health()
    }

    /// Executes one request.
    ///
    /// A request whose token is already cancelled fails with `Cancelled` without
    /// reaching the engine. Otherwise the engine runs in its own task; the task is
    /// tracked in the registry when the input carries a conversation id, and is
    /// aborted when `timeout` elapses, the token is cancelled, or the returned
    /// future is dropped before it completes.
    ///
    /// # Errors
    /// Returns the engine's error, `Timeout`, `Crash` or `Cancelled`.
    pub async fn execute(
        &mut self,
        input: EngineInput,
        timeout: Duration,
        ctx: &ExecutionContext,
    ) -> Result<Value> {
        let engine = self.config.name.clone();
        let token = input.cancellation.clone();
        // Left behind by executions that were dropped mid-flight
        self.runtime.active_tasks.retain(|_, handle| !handle.is_finished());

        if input.is_cancelled() {
            info!(engine = %engine, "Request cancelled before start");
            ctx.events.emit(CoreEvent::ExecutionFinished {
                engine,
                duration_ms: 0,
                status: ExecutionStatus::Cancelled,
            });
            return Err(OrchestrationError::Cancelled { reason: cancellation_reason(token.as_ref()) });
        }

        let started = Instant::now();
        let conversation_id = input.conversation_id.clone();
        let metadata = input.metadata.clone();
        let handler = Arc::clone(&self.config.handler);
        let state = Arc::clone(&self.state);
        let mut handle = tokio::spawn(async move { handler.execute(input, &state).await });

        let task_id = conversation_id.map(|conversation| {
            let task_handle = TaskHandle::new(handle.abort_handle()).with_token(token.clone());
            ctx.tasks.register(task_handle, Some(conversation), &engine, metadata)
        });
        if let Some(id) = &task_id {
            self.runtime.active_tasks.insert(id.clone(), handle.abort_handle());
        }
        let in_flight = InFlight { abort: handle.abort_handle(), tasks: Arc::clone(&ctx.tasks), task_id: task_id.clone() };

        ctx.events.emit(CoreEvent::ExecutionStarted { engine: engine.clone(), task_id: task_id.clone() });

        let watch = token.clone();
        let cancelled = async move {
            match watch {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            joined = tokio::time::timeout(timeout, &mut handle) => match joined {
                Ok(Ok(Ok(value))) => Ok(value),
                Ok(Ok(Err(EngineError::Cancelled))) => {
                    Err(OrchestrationError::Cancelled { reason: cancellation_reason(token.as_ref()) })
                }
                Ok(Ok(Err(err))) => Err(OrchestrationError::Engine(err)),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    Err(OrchestrationError::Crash(panic_reason(join_err.into_panic())))
                }
                Ok(Err(_)) => Err(OrchestrationError::Cancelled { reason: Some("task aborted".to_string()) }),
                Err(_) => {
                    handle.abort();
                    Err(OrchestrationError::Timeout {
                        engine: engine.clone(),
                        timeout_ms: duration_ms(timeout),
                    })
                }
            },
            () = cancelled => {
                handle.abort();
                Err(OrchestrationError::Cancelled { reason: cancellation_reason(token.as_ref()) })
            }
        };

        if let Some(id) = &task_id {
            self.runtime.active_tasks.remove(id);
        }
        drop(in_flight);

        let status = outcome_status(&outcome);
        self.record(status);

        let elapsed = duration_ms(started.elapsed());
        match &outcome {
            Ok(_) => debug!(engine = %engine, worker = self.id, duration_ms = elapsed, "Execution succeeded"),
            Err(e) => warn!(engine = %engine, worker = self.id, duration_ms = elapsed, status = %status, error = %e, "Execution failed"),
        }
        ctx.events.emit(CoreEvent::ExecutionFinished { engine, duration_ms: elapsed, status });

        outcome
    }

    fn record(&mut self, status: ExecutionStatus) {
        match status {
            ExecutionStatus::Success => self.runtime.request_count += 1,
            ExecutionStatus::Error | ExecutionStatus::Crash | ExecutionStatus::Timeout => {
                self.runtime.request_count += 1;
                self.runtime.error_count += 1;
            }
            ExecutionStatus::Cancelled => {}
        }
        if status == ExecutionStatus::Crash {
            self.runtime.status = EngineStatus::Error;
        }
    }

    /// Aborts every in-flight task of this worker.
    pub fn stop(&mut self) {
        for (task_id, handle) in self.runtime.active_tasks.drain() {
            debug!(engine = %self.config.name, task_id = %task_id, "Aborting task on worker stop");
            handle.abort();
        }
        self.runtime.status = EngineStatus::Stopped;
    }
}

/// Maps an execution result onto its event status.
#[must_use]
pub fn outcome_status(outcome: &Result<Value>) -> ExecutionStatus {
    match outcome {
        Ok(_) => ExecutionStatus::Success,
        Err(OrchestrationError::Timeout { .. }) => ExecutionStatus::Timeout,
        Err(OrchestrationError::Crash(_)) => ExecutionStatus::Crash,
        Err(OrchestrationError::Cancelled { .. }) => ExecutionStatus::Cancelled,
        Err(_) => ExecutionStatus::Error,
    }
}

fn cancellation_reason(token: Option<&CancellationToken>) -> Option<String> {
    token.and_then(|t| t.state().ok()).and_then(|s| s.reason)
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchyard_abstraction::{Engine, EngineResult};

    #[derive(Default)]
    struct ScriptedEngine {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Engine for ScriptedEngine {
        async fn init(&self, config: &Value) -> EngineResult<EngineState> {
            if config["fail_init"] == true {
                return Err(EngineError::Init("refused".into()));
            }
            Ok(EngineState::new(config.clone()))
        }

        async fn execute(&self, input: EngineInput, _state: &EngineState) -> EngineResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match input.payload["mode"].as_str() {
                Some("sleep") => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(json!("late"))
                }
                Some("error") => Err(EngineError::Failed("bad input".into())),
                Some("panic") => panic!("engine blew up"),
                _ => Ok(input.payload),
            }
        }
    }

    fn context() -> ExecutionContext {
        let events = EventBus::default();
        ExecutionContext {
            tasks: Arc::new(TaskRegistry::new(events.clone(), Duration::from_secs(300))),
            events,
        }
    }

    async fn worker(engine: Arc<ScriptedEngine>) -> EngineWorker {
        let config = Arc::new(EngineConfig::new("scripted", engine));
        EngineWorker::start(0, config).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_failure_is_reported() {
        let config = Arc::new(
            EngineConfig::new("scripted", Arc::new(ScriptedEngine::default()))
                .with_config(json!({"fail_init": true})),
        );
        let err = EngineWorker::start(0, config).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InitFailed { .. }));
    }

    #[tokio::test]
    async fn test_success_counts_request() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let ctx = context();
        let result = worker.execute(EngineInput::new(json!({"x": 1})), Duration::from_secs(1), &ctx).await;
        assert_eq!(result.unwrap(), json!({"x": 1}));
        assert_eq!(worker.runtime().request_count, 1);
        assert_eq!(worker.runtime().error_count, 0);
    }

    #[tokio::test]
    async fn test_engine_error_counts_both() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let result = worker
            .execute(EngineInput::new(json!({"mode": "error"})), Duration::from_secs(1), &context())
            .await;
        assert!(matches!(result, Err(OrchestrationError::Engine(EngineError::Failed(_)))));
        assert_eq!(worker.runtime().request_count, 1);
        assert_eq!(worker.runtime().error_count, 1);
    }

    #[tokio::test]
    async fn test_timeout_terminates_work() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let started = Instant::now();
        let result = worker
            .execute(EngineInput::new(json!({"mode": "sleep"})), Duration::from_millis(50), &context())
            .await;
        assert!(matches!(result, Err(OrchestrationError::Timeout { timeout_ms: 50, .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_crash() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let result = worker
            .execute(EngineInput::new(json!({"mode": "panic"})), Duration::from_secs(1), &context())
            .await;
        match result {
            Err(OrchestrationError::Crash(reason)) => assert!(reason.contains("engine blew up")),
            other => panic!("expected crash, got {other:?}"),
        }
        assert_eq!(worker.runtime().status, EngineStatus::Error);
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_engine() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut worker = worker(Arc::clone(&engine)).await;
        let token = CancellationToken::new(None);
        token.cancel("user abort");

        let input = EngineInput::new(json!({})).with_cancellation(token);
        let result = worker.execute(input, Duration::from_secs(1), &context()).await;

        match result {
            Err(OrchestrationError::Cancelled { reason }) => assert_eq!(reason.as_deref(), Some("user abort")),
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mid_flight_cancellation() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let ctx = context();
        let token = CancellationToken::new(Some("conv".into()));
        let input = EngineInput::new(json!({"mode": "sleep"}))
            .with_conversation("conv")
            .with_cancellation(token.clone());

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                token.cancel("stop");
            })
        };

        let result = worker.execute(input, Duration::from_secs(2), &ctx).await;
        canceller.await.unwrap();
        assert!(matches!(result, Err(OrchestrationError::Cancelled { .. })));
        assert!(ctx.tasks.is_empty());
        assert!(worker.runtime().active_tasks.is_empty());
    }

    #[tokio::test]
    async fn test_conversation_task_is_tracked_while_running() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let ctx = context();
        let tasks = Arc::clone(&ctx.tasks);

        let observer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let found = tasks.find_by_conversation("conv");
            let cancelled = tasks.cancel_conversation_tasks("conv");
            (found.len(), cancelled)
        });

        let input = EngineInput::new(json!({"mode": "sleep"})).with_conversation("conv");
        let result = worker.execute(input, Duration::from_secs(2), &ctx).await;

        assert_eq!(observer.await.unwrap(), (1, 1));
        assert!(matches!(result, Err(OrchestrationError::Cancelled { .. })));
        assert!(ctx.tasks.is_empty());
    }

    #[tokio::test]
    async fn test_events_for_execution() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let ctx = context();
        let mut rx = ctx.events.subscribe();

        worker.execute(EngineInput::new(json!(1)), Duration::from_secs(1), &ctx).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), CoreEvent::ExecutionStarted { .. }));
        match rx.recv().await.unwrap() {
            CoreEvent::ExecutionFinished { engine, status, .. } => {
                assert_eq!(engine, "scripted");
                assert_eq!(status, ExecutionStatus::Success);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_execution_aborts_engine_task() {
        let mut worker = worker(Arc::new(ScriptedEngine::default())).await;
        let ctx = context();
        let input = EngineInput::new(json!({"mode": "sleep"})).with_conversation("conv");

        let dropped =
            tokio::time::timeout(Duration::from_millis(30), worker.execute(input, Duration::from_secs(5), &ctx)).await;
        assert!(dropped.is_err());
        assert!(ctx.tasks.is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(worker.runtime().active_tasks.values().all(AbortHandle::is_finished));

        // the worker stays usable and forgets the abandoned task
        let result = worker.execute(EngineInput::new(json!(2)), Duration::from_secs(1), &ctx).await;
        assert_eq!(result.unwrap(), json!(2));
        assert!(worker.runtime().active_tasks.is_empty());
    }
}
