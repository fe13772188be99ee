//! Engine selection for capability-based execution.

use crate::registry::EngineConfig;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// How an engine is picked among those advertising a capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// The first candidate in name order.
    #[default]
    First,
    /// A uniformly random candidate.
    Random,
    /// Candidates in turn, per capability.
    RoundRobin,
}

/// Picks engines for capability-based requests.
#[derive(Debug, Default)]
pub struct EngineSelector {
    /// Round-robin cursor per capability.
    cursors: DashMap<String, AtomicUsize>,
}

impl EngineSelector {
    /// Creates a selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects one candidate.
    ///
    /// # Arguments
    /// * `capability` - Capability the candidates were resolved for
    /// * `candidates` - Live engines advertising the capability
    /// * `strategy` - Selection strategy
    ///
    /// # Returns
    /// The selected engine, or `None` if there are no candidates.
    pub fn select(
        &self,
        capability: &str,
        candidates: &[Arc<EngineConfig>],
        strategy: SelectionStrategy,
    ) -> Option<Arc<EngineConfig>> {
        if candidates.is_empty() {
            return None;
        }

        let index = match strategy {
            SelectionStrategy::First => 0,
            SelectionStrategy::Random => rand::thread_rng().gen_range(0..candidates.len()),
            SelectionStrategy::RoundRobin => {
                let cursor = self.cursors.entry(capability.to_string()).or_default();
                cursor.fetch_add(1, Ordering::Relaxed) % candidates.len()
            }
        };

        let selected = Arc::clone(&candidates[index]);
        debug!(capability = %capability, strategy = ?strategy, engine = %selected.name, "Selected engine");
        Some(selected)
    }
}
