//! Engine lifecycle management.
//!
//! Tracks the status of every started engine. The lifecycle map doubles as the
//! live-engine directory: an engine is alive while its status is `Ready`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Engine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineStatus {
    /// Workers are being initialized.
    Initializing,
    /// Workers are up and accepting requests.
    Ready,
    /// The engine failed and is not serving requests.
    Error,
    /// The engine was stopped.
    Stopped,
}

impl EngineStatus {
    /// Checks if the engine can transition to the given status.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            (Self::Initializing, Self::Ready | Self::Error | Self::Stopped) => true,
            // Ready -> Initializing covers re-initializing a running engine
            (Self::Ready, Self::Initializing | Self::Error | Self::Stopped) => true,
            (Self::Error, Self::Initializing | Self::Stopped) => true,
            (Self::Stopped, Self::Initializing) => true,
            (a, b) if *a == b => true,
            _ => false,
        }
    }

    /// Health reported for this status.
    #[must_use]
    pub fn health(&self) -> HealthStatus {
        match self {
            Self::Ready => HealthStatus::Healthy,
            Self::Error => HealthStatus::Unhealthy,
            Self::Initializing | Self::Stopped => HealthStatus::Unknown,
        }
    }
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Ready => write!(f, "ready"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Result of an engine health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// The engine is serving requests.
    Healthy,
    /// The engine is failing.
    Unhealthy,
    /// The engine's health cannot be determined.
    Unknown,
}

/// Lifecycle manager for engines.
pub struct EngineLifecycle {
    /// Map of engine name to current status.
    states: Arc<RwLock<HashMap<String, EngineStatus>>>,
}

impl fmt::Debug for EngineLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLifecycle")
            .field("engine_count", &self.states.try_read().map(|s| s.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl EngineLifecycle {
    /// Creates a new lifecycle manager.
    #[must_use]
    pub fn new() -> Self {
        Self { states: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Gets the current status of an engine, if tracked.
    pub async fn get_status(&self, engine: &str) -> Option<EngineStatus> {
        self.states.read().await.get(engine).copied()
    }

    /// Sets the status of an engine.
    ///
    /// Untracked engines start from `Stopped`.
    ///
    /// # Returns
    /// Returns `Ok` with the previous status if the transition is valid,
    /// or `Err` with the current status if it is not.
    pub async fn set_status(
        &self,
        engine: &str,
        new_status: EngineStatus,
    ) -> Result<EngineStatus, EngineStatus> {
        let mut states = self.states.write().await;
        let current = states.get(engine).copied().unwrap_or(EngineStatus::Stopped);

        if !current.can_transition_to(new_status) {
            error!(engine = %engine, from = %current, to = %new_status, "Invalid engine status transition");
            return Err(current);
        }

        debug!(engine = %engine, from = %current, to = %new_status, "Engine status transition");
        states.insert(engine.to_string(), new_status);
        Ok(current)
    }

    /// Marks an engine as initializing.
    pub async fn mark_initializing(&self, engine: &str) -> Result<(), EngineStatus> {
        self.set_status(engine, EngineStatus::Initializing).await.map(|_| ())
    }

    /// Marks an engine as ready.
    pub async fn mark_ready(&self, engine: &str) -> Result<(), EngineStatus> {
        self.set_status(engine, EngineStatus::Ready).await.map(|_| ())
    }

    /// Marks an engine as failed.
    pub async fn mark_error(&self, engine: &str) -> Result<(), EngineStatus> {
        self.set_status(engine, EngineStatus::Error).await.map(|_| ())
    }

    /// Marks an engine as stopped.
    pub async fn mark_stopped(&self, engine: &str) -> Result<(), EngineStatus> {
        self.set_status(engine, EngineStatus::Stopped).await.map(|_| ())
    }

    /// Returns `true` if the engine is ready to serve requests.
    pub async fn is_alive(&self, engine: &str) -> bool {
        matches!(self.get_status(engine).await, Some(EngineStatus::Ready))
    }

    /// Removes an engine from lifecycle tracking.
    pub async fn remove(&self, engine: &str) {
        self.states.write().await.remove(engine);
        debug!(engine = %engine, "Removed engine from lifecycle tracking");
    }

    /// Returns the status of every tracked engine.
    pub async fn snapshot(&self) -> HashMap<String, EngineStatus> {
        self.states.read().await.clone()
    }
}

impl Default for EngineLifecycle {
    fn default() -> Self {
        Self::new()
    }
}
