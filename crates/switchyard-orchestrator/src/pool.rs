//! Bounded pool of warm workers per engine.
//!
//! Concurrency is bounded by a semaphore with `pool_size + max_overflow` permits.
//! Idle workers are reused; when none is idle an overflow worker is started and
//! dropped again on checkin once the pool is back at `pool_size`.

use crate::error::{OrchestrationError, Result};
use crate::events::{CoreEvent, EventBus};
use crate::lifecycle::{EngineStatus, HealthStatus};
use crate::registry::EngineConfig;
use crate::server::{duration_ms, EngineWorker, ExecutionContext};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use switchyard_abstraction::EngineInput;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Utilization snapshot of a pool, computed from live worker counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Idle workers.
    pub available: usize,
    /// Workers serving a request.
    pub checked_out: usize,
    /// Live workers beyond `pool_size`.
    pub overflow: usize,
    /// Live workers.
    pub total: usize,
    /// Configured warm workers.
    pub pool_size: usize,
    /// Configured burst capacity.
    pub max_overflow: usize,
}

/// Aggregate request counters across the pool's workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    /// Requests that reached the engine.
    pub requests: u64,
    /// Requests that ended in an error, crash or timeout.
    pub errors: u64,
}

/// Idle workers and the checked-out count, shared with outstanding checkouts.
struct Slots {
    engine: String,
    pool_size: usize,
    max_overflow: usize,
    idle: Mutex<Vec<EngineWorker>>,
    checked_out: AtomicUsize,
    events: EventBus,
}

impl Slots {
    fn idle_workers(&self) -> MutexGuard<'_, Vec<EngineWorker>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, mut worker: EngineWorker, crashed: bool) {
        if crashed {
            worker.stop();
            self.checked_out.fetch_sub(1, Ordering::SeqCst);
            warn!(engine = %self.engine, worker = worker.id(), "Discarded crashed worker");
        } else {
            let mut idle = self.idle_workers();
            if idle.len() + self.checked_out.load(Ordering::SeqCst) <= self.pool_size {
                idle.push(worker);
            } else {
                debug!(engine = %self.engine, worker = worker.id(), "Dropping overflow worker");
            }
            self.checked_out.fetch_sub(1, Ordering::SeqCst);
        }
        self.emit_utilization();
    }

    fn status(&self) -> PoolStatus {
        let available = self.idle_workers().len();
        let checked_out = self.checked_out.load(Ordering::SeqCst);
        let total = available + checked_out;
        PoolStatus {
            available,
            checked_out,
            overflow: total.saturating_sub(self.pool_size),
            total,
            pool_size: self.pool_size,
            max_overflow: self.max_overflow,
        }
    }

    fn emit_utilization(&self) {
        let status = self.status();
        self.events.emit(CoreEvent::PoolUtilization {
            engine: self.engine.clone(),
            available: status.available,
            checked_out: status.checked_out,
            overflow: status.overflow,
            total: status.total,
        });
    }
}

/// A worker checked out of a pool.
///
/// Dropping it returns the worker to the pool; [`EnginePool::discard`] stops
/// it instead. The concurrency slot is freed after the worker is back.
pub struct PooledWorker {
    worker: Option<EngineWorker>,
    crashed: bool,
    slots: Arc<Slots>,
    _permit: OwnedSemaphorePermit,
}

impl fmt::Debug for PooledWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledWorker").field("worker", &self.id()).finish_non_exhaustive()
    }
}

impl PooledWorker {
    /// Id of the checked-out worker.
    #[must_use]
    pub fn id(&self) -> Option<usize> {
        self.worker.as_ref().map(EngineWorker::id)
    }

    /// Runs one request on the checked-out worker.
    ///
    /// # Errors
    /// Returns the execution error.
    pub async fn execute(&mut self, input: EngineInput, timeout: Duration, ctx: &ExecutionContext) -> Result<Value> {
        let Some(worker) = self.worker.as_mut() else {
            return Err(OrchestrationError::PoolNotFound(self.slots.engine.clone()));
        };
        worker.execute(input, timeout, ctx).await
    }
}

impl Drop for PooledWorker {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.slots.release(worker, self.crashed);
        }
    }
}

/// Worker pool for one engine.
pub struct EnginePool {
    config: Arc<EngineConfig>,
    slots: Arc<Slots>,
    permits: Arc<Semaphore>,
    next_worker_id: AtomicUsize,
    requests: AtomicU64,
    errors: AtomicU64,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
    checkout_timeout: Duration,
    events: EventBus,
}

impl fmt::Debug for EnginePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnginePool")
            .field("engine", &self.config.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl EnginePool {
    /// Starts `pool_size` workers.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InitFailed` if any worker fails to initialize.
    pub async fn start(config: Arc<EngineConfig>, checkout_timeout: Duration, events: EventBus) -> Result<Self> {
        let pool = Self {
            permits: Arc::new(Semaphore::new(config.pool_size + config.max_overflow)),
            slots: Arc::new(Slots {
                engine: config.name.clone(),
                pool_size: config.pool_size,
                max_overflow: config.max_overflow,
                idle: Mutex::new(Vec::with_capacity(config.pool_size)),
                checked_out: AtomicUsize::new(0),
                events: events.clone(),
            }),
            next_worker_id: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            last_health_check: Mutex::new(None),
            checkout_timeout,
            events,
            config,
        };

        for _ in 0..pool.config.pool_size {
            let worker = pool.spawn_worker().await?;
            pool.idle_workers().push(worker);
        }

        info!(
            engine = %pool.config.name,
            pool_size = pool.config.pool_size,
            max_overflow = pool.config.max_overflow,
            "Engine pool started"
        );
        Ok(pool)
    }

    fn idle_workers(&self) -> MutexGuard<'_, Vec<EngineWorker>> {
        self.slots.idle_workers()
    }

    async fn spawn_worker(&self) -> Result<EngineWorker> {
        let id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        EngineWorker::start(id, Arc::clone(&self.config)).await
    }

    /// Engine descriptor served by this pool.
    #[must_use]
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Checks out a worker, waiting up to the checkout timeout for a free slot.
    ///
    /// A timed-out checkout emits [`CoreEvent::ExecutionRejected`].
    ///
    /// # Errors
    /// Returns `CheckoutTimeout` if no slot frees up in time, `PoolNotFound` if
    /// the pool was closed, or `InitFailed` if an overflow worker fails to start.
    pub async fn checkout(&self) -> Result<PooledWorker> {
        let permit = match tokio::time::timeout(self.checkout_timeout, Arc::clone(&self.permits).acquire_owned()).await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(OrchestrationError::PoolNotFound(self.config.name.clone())),
            Err(_) => {
                let waited_ms = duration_ms(self.checkout_timeout);
                warn!(engine = %self.config.name, waited_ms, "Checkout timed out");
                let err = OrchestrationError::CheckoutTimeout { engine: self.config.name.clone(), waited_ms };
                self.events.emit(CoreEvent::ExecutionRejected {
                    target: self.config.name.clone(),
                    reason: err.to_string(),
                });
                return Err(err);
            }
        };

        let reused = self.idle_workers().pop();
        let worker = match reused {
            Some(worker) => worker,
            None => {
                debug!(engine = %self.config.name, "Starting overflow worker");
                self.spawn_worker().await?
            }
        };

        self.slots.checked_out.fetch_add(1, Ordering::SeqCst);
        self.slots.emit_utilization();
        Ok(PooledWorker { worker: Some(worker), crashed: false, slots: Arc::clone(&self.slots), _permit: permit })
    }

    /// Returns a worker to the pool. Workers beyond `pool_size` are dropped.
    #[allow(clippy::unused_self)] // Pairs with `checkout`
    pub fn checkin(&self, pooled: PooledWorker) {
        drop(pooled);
    }

    /// Drops a crashed worker without returning it to the pool.
    #[allow(clippy::unused_self)] // Pairs with `checkout`
    pub fn discard(&self, mut pooled: PooledWorker) {
        pooled.crashed = true;
        drop(pooled);
    }

    /// Starts workers until the pool is back at `pool_size`.
    ///
    /// # Returns
    /// The number of workers started.
    ///
    /// # Errors
    /// Returns `OrchestrationError::InitFailed` if a replacement fails to start.
    pub async fn replenish(&self) -> Result<usize> {
        let mut started = 0;
        loop {
            let live = self.idle_workers().len() + self.slots.checked_out.load(Ordering::SeqCst);
            if live >= self.config.pool_size {
                break;
            }
            let worker = self.spawn_worker().await?;
            self.idle_workers().push(worker);
            started += 1;
        }
        if started > 0 {
            self.slots.emit_utilization();
        }
        Ok(started)
    }

    /// Runs one request on a checked-out worker.
    ///
    /// Crashed workers are discarded; every other outcome returns the worker,
    /// including the caller dropping the returned future early.
    ///
    /// # Errors
    /// Returns checkout errors or the execution error.
    pub async fn execute(&self, input: EngineInput, timeout: Duration, ctx: &ExecutionContext) -> Result<Value> {
        let mut pooled = self.checkout().await?;
        let outcome = pooled.execute(input, timeout, ctx).await;

        if !matches!(outcome, Err(OrchestrationError::Cancelled { .. })) {
            self.requests.fetch_add(1, Ordering::Relaxed);
            if outcome.is_err() {
                self.errors.fetch_add(1, Ordering::Relaxed);
            }
        }

        if matches!(outcome, Err(OrchestrationError::Crash(_))) {
            self.discard(pooled);
        } else {
            self.checkin(pooled);
        }
        outcome
    }

    /// Runs a health check against the engine status.
    pub fn health_check(&self, status: EngineStatus) -> HealthStatus {
        let health = if self.permits.is_closed() { HealthStatus::Unknown } else { status.health() };
        *self.last_health_check.lock().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        for worker in self.idle_workers().iter_mut() {
            worker.health_check();
        }
        self.events.emit(CoreEvent::HealthCheck { engine: self.config.name.clone(), health });
        health
    }

    /// When the pool was last health-checked.
    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current utilization.
    pub fn status(&self) -> PoolStatus {
        self.slots.status()
    }

    /// Aggregate request counters.
    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Closes the pool: pending and future checkouts fail and idle workers stop.
    pub fn close(&self) {
        self.permits.close();
        let mut idle = self.idle_workers();
        for worker in idle.iter_mut() {
            worker.stop();
        }
        idle.clear();
        info!(engine = %self.config.name, "Engine pool closed");
    }
}
