//! Load balancer for provider selection.
//!
//! Tracks in-flight requests per provider and picks the best-scoring provider
//! that still has capacity, feeding the current load into the score.

use super::providers::ProviderInfo;
use super::scorer::{ProviderScore, ProviderScorer, Requirements};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Load balancer for provider request distribution.
pub struct LoadBalancer {
    /// Current load per provider (number of in-flight requests).
    provider_loads: Mutex<HashMap<String, usize>>,
    /// Maximum concurrent requests per provider.
    max_concurrent_per_provider: usize,
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("max_concurrent_per_provider", &self.max_concurrent_per_provider)
            .finish_non_exhaustive()
    }
}

/// Decrements a provider's load when dropped.
#[derive(Debug)]
pub struct LoadGuard {
    balancer: Arc<LoadBalancer>,
    provider: String,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.balancer.decrement_load(&self.provider);
    }
}

impl LoadBalancer {
    /// Creates a new load balancer.
    ///
    /// # Arguments
    /// * `max_concurrent_per_provider` - Maximum number of in-flight requests per provider
    #[must_use]
    pub fn new(max_concurrent_per_provider: usize) -> Self {
        Self { provider_loads: Mutex::new(HashMap::new()), max_concurrent_per_provider: max_concurrent_per_provider.max(1) }
    }

    fn loads(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.provider_loads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Increments the load for a provider.
    pub fn increment_load(&self, provider: &str) {
        let mut loads = self.loads();
        let load = loads.entry(provider.to_string()).or_insert(0);
        *load += 1;
        debug!(provider = %provider, load = *load, "Incremented provider load");
    }

    /// Decrements the load for a provider.
    pub fn decrement_load(&self, provider: &str) {
        let mut loads = self.loads();
        match loads.get_mut(provider) {
            Some(load) if *load > 0 => {
                *load -= 1;
                debug!(provider = %provider, load = *load, "Decremented provider load");
            }
            Some(_) => warn!(provider = %provider, "Attempted to decrement load below zero"),
            None => warn!(provider = %provider, "Attempted to decrement load for unknown provider"),
        }
    }

    /// Increments a provider's load until the returned guard is dropped.
    pub fn track(self: &Arc<Self>, provider: &str) -> LoadGuard {
        self.increment_load(provider);
        LoadGuard { balancer: Arc::clone(self), provider: provider.to_string() }
    }

    /// Gets the current load for a provider.
    pub fn get_load(&self, provider: &str) -> usize {
        self.loads().get(provider).copied().unwrap_or(0)
    }

    /// Gets a provider's utilization (0.0-1.0).
    pub fn get_utilization(&self, provider: &str) -> f64 {
        utilization(self.get_load(provider), self.max_concurrent_per_provider)
    }

    /// Gets the utilization of every provider seen so far.
    pub fn get_provider_utilization(&self) -> HashMap<String, f64> {
        self.loads()
            .iter()
            .map(|(provider, load)| (provider.clone(), utilization(*load, self.max_concurrent_per_provider)))
            .collect()
    }

    /// Selects the best-scoring provider below capacity.
    ///
    /// Each candidate is scored with its current load substituted in.
    ///
    /// # Returns
    /// The winning score, or `None` if every candidate is at capacity.
    pub fn select(
        &self,
        candidates: &[ProviderInfo],
        requirements: &Requirements,
        scorer: &ProviderScorer,
    ) -> Option<ProviderScore> {
        let loads = self.loads().clone();
        let available: Vec<ProviderInfo> = candidates
            .iter()
            .filter(|p| loads.get(&p.id).copied().unwrap_or(0) < self.max_concurrent_per_provider)
            .map(|p| {
                let mut info = p.clone();
                let load = loads.get(&p.id).copied().unwrap_or(0);
                info.current_load = info.current_load.max(utilization(load, self.max_concurrent_per_provider));
                info
            })
            .collect();

        let best = scorer.best(&available, requirements);
        if let Some(score) = &best {
            debug!(provider = %score.provider, score = score.total, "Selected provider");
        }
        best
    }
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new(64)
    }
}

#[allow(clippy::cast_precision_loss)] // Loads are small
fn utilization(load: usize, capacity: usize) -> f64 {
    (load as f64 / capacity as f64).min(1.0)
}
