// Error types for orchestration

use crate::config::ConfigError;
use switchyard_abstraction::EngineError;
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// No pool is running for the engine
    #[error("No pool running for engine '{0}'")]
    PoolNotFound(String),

    /// No worker became free before the checkout timeout
    #[error("Timed out after {waited_ms}ms waiting for a worker of engine '{engine}'")]
    CheckoutTimeout {
        /// Engine name
        engine: String,
        /// How long the caller waited
        waited_ms: u64,
    },

    /// The engine is not registered
    #[error("Engine not found: {0}")]
    EngineNotFound(String),

    /// No live engine advertises the capability
    #[error("No engine with capability '{0}'")]
    NoEngineWithCapability(String),

    /// The provider's rate limit is exhausted for the current window
    #[error("Rate limit exceeded for provider '{provider}', retry after {retry_after_ms}ms")]
    RateLimited {
        /// Provider name
        provider: String,
        /// Recommended delay before retrying
        retry_after_ms: u64,
    },

    /// The provider's circuit is open
    #[error("Circuit open for provider '{0}'")]
    CircuitOpen(String),

    /// The engine exhausted its restart budget and is no longer served
    #[error("Engine '{engine}' failed: {reason}")]
    EngineFailed {
        /// Engine name
        engine: String,
        /// Why supervision gave up
        reason: String,
    },

    /// Domain error reported by the engine
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Execution exceeded its timeout and was terminated
    #[error("Execution on engine '{engine}' timed out after {timeout_ms}ms")]
    Timeout {
        /// Engine name
        engine: String,
        /// Timeout that elapsed
        timeout_ms: u64,
    },

    /// The unit of work crashed
    #[error("Execution crashed: {0}")]
    Crash(String),

    /// The execution was cancelled
    #[error("Execution cancelled{}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Cancelled {
        /// Cancellation reason, if known
        reason: Option<String>,
    },

    /// An engine failed to initialize
    #[error("Engine '{engine}' failed to initialize: {source}")]
    InitFailed {
        /// Engine name
        engine: String,
        /// Error returned by the engine's init
        source: EngineError,
    },

    /// The engine is already running
    #[error("Engine '{0}' is already running")]
    AlreadyRunning(String),

    /// Invalid runtime reconfiguration
    #[error("Invalid adjustment: {0}")]
    InvalidAdjustment(String),

    /// Failover found no usable alternate provider
    #[error("No alternative provider available to replace '{0}'")]
    NoAlternatives(String),

    /// The provider already failed over as many times as allowed
    #[error("Failover attempts exhausted for provider '{provider}' after {attempts} attempts")]
    FailoverExhausted {
        /// Original provider
        provider: String,
        /// Attempts made
        attempts: u32,
    },

    /// The original provider has not recovered enough to fail back
    #[error("Recovery not ready: {0}")]
    RecoveryNotReady(String),

    /// The provider health check itself failed
    #[error("Health check failed for provider '{provider}': {reason}")]
    HealthCheckFailed {
        /// Provider name
        provider: String,
        /// Failure reason
        reason: String,
    },

    /// A recovery operation was requested while no failover is active
    #[error("No failover in progress")]
    NotInFailover,

    /// The provider is unknown to the provider directory
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The task id is not registered
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestrationError {
    /// Returns `true` for errors raised before the request reached an engine or provider.
    #[must_use]
    pub fn is_admission(&self) -> bool {
        matches!(
            self,
            Self::PoolNotFound(_)
                | Self::CheckoutTimeout { .. }
                | Self::EngineNotFound(_)
                | Self::NoEngineWithCapability(_)
                | Self::RateLimited { .. }
                | Self::CircuitOpen(_)
                | Self::EngineFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admission_classification() {
        assert!(OrchestrationError::PoolNotFound("e".into()).is_admission());
        assert!(OrchestrationError::CircuitOpen("p".into()).is_admission());
        assert!(!OrchestrationError::Crash("panic".into()).is_admission());
        assert!(!OrchestrationError::Engine(EngineError::Failed("x".into())).is_admission());
    }

    #[test]
    fn test_display() {
        let err = OrchestrationError::Cancelled { reason: Some("user".into()) };
        assert_eq!(err.to_string(), "Execution cancelled: user");
        let err = OrchestrationError::Cancelled { reason: None };
        assert_eq!(err.to_string(), "Execution cancelled");
        let err = OrchestrationError::Engine(EngineError::Failed("bad".into()));
        assert_eq!(err.to_string(), "Engine execution failed: bad");
    }
}
