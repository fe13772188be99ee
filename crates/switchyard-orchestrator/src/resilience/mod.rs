//! Provider resilience layer.
//!
//! Gates upstream provider calls with per-provider rate limits and circuit
//! breakers, scores providers for selection, and fails traffic over to an
//! alternate provider when one degrades.

pub mod circuit_breaker;
pub mod failover;
pub mod health;
pub mod load_balancer;
pub mod manager;
pub mod providers;
pub mod rate_limiter;
pub mod scorer;

pub use circuit_breaker::{BreakerSettings, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use failover::{
    FailoverAssessment, FailoverOrchestrator, FailoverState, FailoverTriggers, FailureAnalysis, FailureEvent,
    FailureKind, Recommendation, RecoveryStatus,
};
pub use health::{AlwaysReachable, ConnectivityProbe, HealthMonitor, HealthReport, HealthTracker, OutcomeStats};
pub use load_balancer::{LoadBalancer, LoadGuard};
pub use manager::{CallError, Resilience};
pub use providers::{ProviderDirectory, ProviderHealth, ProviderInfo, ProviderMetadata};
pub use rate_limiter::{LimitChange, RateLimitSettings, RateLimitStatus, RateLimiter, TuningSuggestion};
pub use scorer::{MatchQuality, PriorityProfile, ProviderScore, ProviderScorer, Requirements, ScoreWeights, ScoringOptions};
