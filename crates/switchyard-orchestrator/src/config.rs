//! TOML configuration for the orchestration core.
//!
//! The configuration is an explicit struct threaded through constructors at
//! startup. Durations are written as integer milliseconds in the file.

use crate::resilience::{BreakerSettings, PriorityProfile, RateLimitSettings};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file.
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("Failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Execution defaults.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExecutionSettings {
    /// Timeout applied when neither the call nor the engine sets one.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long `execute` waits for a free worker.
    #[serde(default = "default_timeout_ms")]
    pub checkout_timeout_ms: u64,
    /// Interval between engine health checks.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_interval_ms() -> u64 {
    30_000
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            checkout_timeout_ms: default_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl ExecutionSettings {
    /// Default execution timeout.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Worker checkout timeout.
    #[must_use]
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    /// Health check interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

/// Worker restart budget.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SupervisionSettings {
    /// Restarts allowed inside one window.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    /// Length of the restart window.
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,
}

fn default_max_restarts() -> usize {
    3
}

fn default_restart_window_ms() -> u64 {
    5_000
}

impl Default for SupervisionSettings {
    fn default() -> Self {
        Self { max_restarts: default_max_restarts(), restart_window_ms: default_restart_window_ms() }
    }
}

impl SupervisionSettings {
    /// Restart window.
    #[must_use]
    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

/// Task registry housekeeping.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TaskSettings {
    /// How long finished entries may linger before the sweep purges them.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Interval between sweeps.
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

fn default_retention_ms() -> u64 {
    300_000
}

fn default_sweep_interval_ms() -> u64 {
    60_000
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self { retention_ms: default_retention_ms(), sweep_interval_ms: default_sweep_interval_ms() }
    }
}

impl TaskSettings {
    /// Retention window for stale entries.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    /// Sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Declared engine settings.
///
/// The handler itself is supplied in code; see [`crate::EngineConfig::from_settings`].
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// Unique engine name.
    pub name: String,
    /// Warm workers kept in the pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Extra workers allowed under burst load.
    #[serde(default)]
    pub max_overflow: usize,
    /// Execution timeout for this engine.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Opaque configuration passed to the engine's init.
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_pool_size() -> usize {
    1
}

/// Per-provider resilience settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderSettings {
    /// Requests allowed per window; absent means unlimited.
    #[serde(default)]
    pub limit: Option<u32>,
    /// Rate-limit window length.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before probing.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Probe requests allowed while half-open.
    #[serde(default = "default_half_open_attempts")]
    pub half_open_attempts: u32,
    /// Apply rate-limit tuning suggestions automatically.
    #[serde(default)]
    pub auto_tune: bool,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_attempts() -> u32 {
    1
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            limit: None,
            window_ms: default_window_ms(),
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_attempts: default_half_open_attempts(),
            auto_tune: false,
        }
    }
}

impl ProviderSettings {
    /// Circuit breaker part of the settings.
    #[must_use]
    pub fn breaker(&self) -> BreakerSettings {
        BreakerSettings {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_millis(self.recovery_timeout_ms),
            half_open_attempts: self.half_open_attempts,
        }
    }

    /// Rate limiter part of the settings.
    #[must_use]
    pub fn rate_limit(&self) -> RateLimitSettings {
        RateLimitSettings {
            limit: self.limit,
            window: Duration::from_millis(self.window_ms),
            auto_tune: self.auto_tune,
        }
    }
}

/// Provider scoring settings.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ScoringSettings {
    /// Weight profile used when ranking providers.
    #[serde(default)]
    pub profile: PriorityProfile,
}

/// Failover settings.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct FailoverSettings {
    /// Failover attempts allowed before giving up.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Health score the original provider must reach before failing back.
    #[serde(default = "default_recovery_threshold")]
    pub recovery_threshold: f64,
    /// Fail back automatically once the original recovers.
    #[serde(default = "default_true")]
    pub auto_recovery: bool,
    /// Interval of the recovery monitor.
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,
    /// Longest a connectivity check may take before it counts as failed.
    #[serde(default = "default_connectivity_timeout_ms")]
    pub connectivity_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_recovery_threshold() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval_ms() -> u64 {
    30_000
}

fn default_connectivity_timeout_ms() -> u64 {
    5_000
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            recovery_threshold: default_recovery_threshold(),
            auto_recovery: true,
            monitor_interval_ms: default_monitor_interval_ms(),
            connectivity_timeout_ms: default_connectivity_timeout_ms(),
        }
    }
}

impl FailoverSettings {
    /// Recovery monitor interval.
    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    /// Connectivity check timeout.
    #[must_use]
    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }
}

/// Root configuration for the orchestration core.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct OrchestratorConfig {
    /// Execution defaults.
    #[serde(default)]
    pub execution: ExecutionSettings,
    /// Restart budget.
    #[serde(default)]
    pub supervision: SupervisionSettings,
    /// Task registry housekeeping.
    #[serde(default)]
    pub tasks: TaskSettings,
    /// Declared engines.
    #[serde(default)]
    pub engines: Vec<EngineSettings>,
    /// Per-provider settings keyed by provider name.
    #[serde(default)]
    pub providers: HashMap<String, ProviderSettings>,
    /// Provider scoring.
    #[serde(default)]
    pub scoring: ScoringSettings,
    /// Failover behavior.
    #[serde(default)]
    pub failover: FailoverSettings,
}

impl OrchestratorConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from a TOML string.
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns the settings declared for an engine.
    #[must_use]
    pub fn engine(&self, name: &str) -> Option<&EngineSettings> {
        self.engines.iter().find(|e| e.name == name)
    }

    /// Returns the settings for a provider, falling back to defaults.
    #[must_use]
    pub fn provider(&self, name: &str) -> ProviderSettings {
        self.providers.get(name).cloned().unwrap_or_default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.execution.default_timeout_ms == 0 {
            return Err(ConfigError::Validation("default_timeout_ms must be positive".into()));
        }
        if self.execution.health_check_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "health_check_interval_ms must be positive".into(),
            ));
        }
        if self.supervision.restart_window_ms == 0 {
            return Err(ConfigError::Validation("restart_window_ms must be positive".into()));
        }
        if self.tasks.sweep_interval_ms == 0 {
            return Err(ConfigError::Validation("sweep_interval_ms must be positive".into()));
        }

        let mut seen = std::collections::HashSet::new();
        for engine in &self.engines {
            if engine.name.trim().is_empty() {
                return Err(ConfigError::Validation("engine name must not be empty".into()));
            }
            if !seen.insert(engine.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "engine '{}' is declared more than once",
                    engine.name
                )));
            }
            if engine.pool_size == 0 {
                return Err(ConfigError::Validation(format!(
                    "engine '{}' must have a pool_size of at least 1",
                    engine.name
                )));
            }
            if engine.timeout_ms == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "engine '{}' timeout_ms must be positive",
                    engine.name
                )));
            }
        }

        for (name, provider) in &self.providers {
            if provider.limit == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "provider '{name}' limit must be positive (omit it for unlimited)"
                )));
            }
            if provider.window_ms == 0 {
                return Err(ConfigError::Validation(format!(
                    "provider '{name}' window_ms must be positive"
                )));
            }
            if provider.failure_threshold == 0 {
                return Err(ConfigError::Validation(format!(
                    "provider '{name}' failure_threshold must be at least 1"
                )));
            }
            if provider.half_open_attempts == 0 {
                return Err(ConfigError::Validation(format!(
                    "provider '{name}' half_open_attempts must be at least 1"
                )));
            }
        }

        if self.failover.monitor_interval_ms == 0 {
            return Err(ConfigError::Validation("monitor_interval_ms must be positive".into()));
        }
        if self.failover.connectivity_timeout_ms == 0 {
            return Err(ConfigError::Validation("connectivity_timeout_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.failover.recovery_threshold) {
            return Err(ConfigError::Validation(format!(
                "recovery_threshold {} must be between 0.0 and 1.0",
                self.failover.recovery_threshold
            )));
        }

        Ok(())
    }
}
