//! Lifecycle and metric events.
//!
//! This is the observability boundary of the core: dashboards and log shippers
//! subscribe to the bus and receive every execution outcome, health check, pool
//! snapshot, breaker transition, rate-limit change and failover notice.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tracing::debug;

/// Outcome of a single execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// The engine returned a result.
    Success,
    /// The engine reported a domain error.
    Error,
    /// The unit of work crashed.
    Crash,
    /// The unit of work exceeded its timeout.
    Timeout,
    /// The execution was cancelled.
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Crash => "crash",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Events emitted by the orchestration core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoreEvent {
    /// An execution was handed to a worker.
    ExecutionStarted {
        engine: String,
        task_id: Option<String>,
    },

    /// An execution reached a terminal outcome.
    ExecutionFinished {
        engine: String,
        duration_ms: u64,
        status: ExecutionStatus,
    },

    /// A request was turned away before reaching a worker.
    ///
    /// `target` is the engine name, or the capability for capability routing.
    ExecutionRejected {
        target: String,
        reason: String,
    },

    /// A periodic engine health check ran.
    HealthCheck {
        engine: String,
        health: crate::lifecycle::HealthStatus,
    },

    /// Pool utilization after a checkout or checkin.
    PoolUtilization {
        engine: String,
        available: usize,
        checked_out: usize,
        overflow: usize,
        total: usize,
    },

    /// A crashed worker was replaced.
    EngineRestarted {
        engine: String,
        restarts_in_window: usize,
    },

    /// An engine exhausted its restart budget.
    EngineFailed {
        engine: String,
        reason: String,
    },

    /// A tracked task was cancelled.
    TaskCancelled {
        task_id: String,
        conversation_id: Option<String>,
    },

    /// A provider's circuit changed state.
    CircuitTransition {
        provider: String,
        from: crate::resilience::CircuitState,
        to: crate::resilience::CircuitState,
    },

    /// A provider's rate limit was reconfigured.
    RateLimitAdjusted {
        provider: String,
        limit: Option<u32>,
        window_ms: u64,
        reason: String,
    },

    /// Traffic moved from one provider to another.
    FailoverTriggered {
        from: String,
        to: String,
        reason: String,
    },

    /// Traffic returned to the original provider.
    FailoverRecovered {
        provider: String,
        duration_ms: u64,
    },
}

/// Broadcast bus for [`CoreEvent`]s.
///
/// Emitting never blocks and never fails; events are dropped when nobody listens
/// and slow subscribers observe a lag error from their receiver.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    /// Default channel capacity.
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Creates a bus with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Emits an event to all current subscribers.
    pub fn emit(&self, event: CoreEvent) {
        debug!(event = ?event, "Core event");
        let _ = self.sender.send(event);
    }

    /// Subscribes to events emitted after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
