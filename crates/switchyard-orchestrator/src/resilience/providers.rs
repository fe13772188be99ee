//! Directory of upstream providers and the data used to score them.

use crate::error::{OrchestrationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use tracing::{debug, info};

/// Reported health of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    /// Serving normally.
    #[default]
    Healthy,
    /// Serving with elevated errors or latency.
    Degraded,
    /// Not serving.
    Unhealthy,
}

impl ProviderHealth {
    /// Score used by availability scoring.
    #[must_use]
    pub fn score(self) -> f64 {
        match self {
            Self::Healthy => 1.0,
            Self::Degraded => 0.6,
            Self::Unhealthy => 0.0,
        }
    }
}

/// Performance and pricing figures of a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Average response latency.
    pub avg_latency_ms: f64,
    /// Sustained throughput in requests per second.
    pub throughput_rps: f64,
    /// Uptime over the reporting period, 0-100.
    pub uptime_percentage: f64,
    /// Fraction of failed requests, 0-1.
    pub error_rate: f64,
    /// Price per 1000 tokens.
    pub cost_per_1k_tokens: f64,
    /// Provider-side requests-per-minute cap.
    pub rate_limit_rpm: Option<u32>,
    /// Volume discount, 0-1.
    pub volume_discount: f64,
}

impl Default for ProviderMetadata {
    fn default() -> Self {
        Self {
            avg_latency_ms: 1_000.0,
            throughput_rps: 10.0,
            uptime_percentage: 99.0,
            error_rate: 0.01,
            cost_per_1k_tokens: 0.01,
            rate_limit_rpm: None,
            volume_discount: 0.0,
        }
    }
}

/// Everything known about a provider at scoring time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    /// Provider id.
    pub id: String,
    /// Capabilities the provider advertises.
    pub capabilities: Vec<String>,
    /// Performance and pricing.
    #[serde(default)]
    pub metadata: ProviderMetadata,
    /// Reported health.
    #[serde(default)]
    pub health: ProviderHealth,
    /// In-flight load, 0-1.
    #[serde(default)]
    pub current_load: f64,
    /// Requests issued during the last minute.
    #[serde(default)]
    pub current_usage_rpm: u32,
}

impl ProviderInfo {
    /// Creates a healthy, idle provider with default metadata.
    #[must_use]
    pub fn new(id: impl Into<String>, capabilities: &[&str]) -> Self {
        Self {
            id: id.into(),
            capabilities: capabilities.iter().map(ToString::to_string).collect(),
            metadata: ProviderMetadata::default(),
            health: ProviderHealth::Healthy,
            current_load: 0.0,
            current_usage_rpm: 0,
        }
    }

    /// Sets the metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: ProviderMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Sets the health.
    #[must_use]
    pub fn with_health(mut self, health: ProviderHealth) -> Self {
        self.health = health;
        self
    }

    /// Returns `true` if the provider advertises the capability.
    #[must_use]
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Registry of known providers.
pub struct ProviderDirectory {
    providers: RwLock<HashMap<String, ProviderInfo>>,
}

impl fmt::Debug for ProviderDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderDirectory")
            .field("provider_count", &self.providers.try_read().map(|p| p.len()).unwrap_or(0))
            .finish()
    }
}

impl ProviderDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self { providers: RwLock::new(HashMap::new()) }
    }

    /// Adds or replaces a provider.
    ///
    /// # Returns
    /// Returns `true` if the provider was not known before.
    pub fn register(&self, info: ProviderInfo) -> bool {
        let id = info.id.clone();
        let is_new = self.providers.write().unwrap_or_else(PoisonError::into_inner).insert(id.clone(), info).is_none();
        info!(provider = %id, replaced = !is_new, "Registered provider");
        is_new
    }

    /// Mutates a known provider in place.
    ///
    /// # Errors
    /// Returns `OrchestrationError::UnknownProvider` if the provider is not registered.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut ProviderInfo)) -> Result<()> {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        let info = providers.get_mut(id).ok_or_else(|| OrchestrationError::UnknownProvider(id.to_string()))?;
        f(info);
        debug!(provider = %id, health = ?info.health, "Updated provider");
        Ok(())
    }

    /// Removes a provider.
    pub fn remove(&self, id: &str) -> Option<ProviderInfo> {
        self.providers.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    /// Gets a provider.
    pub fn get(&self, id: &str) -> Option<ProviderInfo> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner).get(id).cloned()
    }

    /// Lists every provider, sorted by id.
    pub fn list(&self) -> Vec<ProviderInfo> {
        let mut providers: Vec<ProviderInfo> =
            self.providers.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));
        providers
    }

    /// Providers that could take over from `excluding`: every other provider not reported unhealthy.
    pub fn alternatives(&self, excluding: &str) -> Vec<ProviderInfo> {
        self.list()
            .into_iter()
            .filter(|p| p.id != excluding && p.health != ProviderHealth::Unhealthy)
            .collect()
    }
}

impl Default for ProviderDirectory {
    fn default() -> Self {
        Self::new()
    }
}
