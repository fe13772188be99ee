//! Capability registry for discovering engines.
//!
//! This module maps capability tags to the engines that advertise them. All
//! mutations go through a single write lock, so a register/unregister pair for
//! the same name never interleaves.

use crate::config::EngineSettings;
use crate::lifecycle::EngineLifecycle;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_abstraction::Engine;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Immutable descriptor of a declared engine.
#[derive(Clone)]
pub struct EngineConfig {
    /// Unique engine name.
    pub name: String,
    /// The engine implementation.
    pub handler: Arc<dyn Engine>,
    /// Opaque configuration passed to `init`.
    pub config: Value,
    /// Execution timeout; the orchestrator default applies when `None`.
    pub timeout: Option<Duration>,
    /// Warm workers kept in the pool.
    pub pool_size: usize,
    /// Extra workers allowed under burst load.
    pub max_overflow: usize,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("timeout", &self.timeout)
            .field("pool_size", &self.pool_size)
            .field("max_overflow", &self.max_overflow)
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    /// Creates a descriptor with a single-worker pool and no overflow.
    #[must_use]
    pub fn new(name: impl Into<String>, handler: Arc<dyn Engine>) -> Self {
        Self {
            name: name.into(),
            handler,
            config: Value::Null,
            timeout: None,
            pool_size: 1,
            max_overflow: 0,
        }
    }

    /// Builds a descriptor from declared settings.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings, handler: Arc<dyn Engine>) -> Self {
        Self {
            name: settings.name.clone(),
            handler,
            config: settings.config.clone(),
            timeout: settings.timeout_ms.map(Duration::from_millis),
            pool_size: settings.pool_size.max(1),
            max_overflow: settings.max_overflow,
        }
    }

    /// Sets the opaque init configuration.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Sets the execution timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size.max(1);
        self
    }

    /// Sets the overflow capacity.
    #[must_use]
    pub fn with_max_overflow(mut self, max_overflow: usize) -> Self {
        self.max_overflow = max_overflow;
        self
    }
}

/// Summary of a registered engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineMetadata {
    /// Engine name.
    pub name: String,
    /// Capabilities the engine advertised at registration.
    pub capabilities: Vec<String>,
    /// Warm workers.
    pub pool_size: usize,
    /// Burst workers.
    pub max_overflow: usize,
    /// Execution timeout in milliseconds, if set.
    pub timeout_ms: Option<u64>,
}

#[derive(Default)]
struct Directory {
    configs: HashMap<String, Arc<EngineConfig>>,
    advertised: HashMap<String, Vec<String>>,
    capabilities: BTreeMap<String, Vec<String>>,
}

impl Directory {
    fn remove_engine(&mut self, name: &str) -> bool {
        let removed = self.configs.remove(name).is_some();
        if let Some(tags) = self.advertised.remove(name) {
            for tag in tags {
                if let Some(engines) = self.capabilities.get_mut(&tag) {
                    engines.retain(|e| e != name);
                    if engines.is_empty() {
                        self.capabilities.remove(&tag);
                    }
                }
            }
        }
        removed
    }
}

/// Registry mapping capability tags to engines.
pub struct CapabilityRegistry {
    directory: Arc<RwLock<Directory>>,
    lifecycle: Arc<EngineLifecycle>,
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("engine_count", &self.directory.try_read().map(|d| d.configs.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl CapabilityRegistry {
    /// Creates an empty registry that checks liveness against `lifecycle`.
    #[must_use]
    pub fn new(lifecycle: Arc<EngineLifecycle>) -> Self {
        Self { directory: Arc::new(RwLock::new(Directory::default())), lifecycle }
    }

    /// Registers an engine under every capability it advertises.
    ///
    /// Re-registering a name replaces the previous descriptor and its capabilities.
    ///
    /// # Returns
    /// Returns `true` if the engine was newly registered, `false` if it replaced an existing one.
    pub async fn register(&self, config: EngineConfig) -> bool {
        let name = config.name.clone();
        let mut tags = config.handler.capabilities();
        tags.sort();
        tags.dedup();

        debug!(engine = %name, capabilities = ?tags, "Registering engine");

        let mut directory = self.directory.write().await;
        let was_new = !directory.remove_engine(&name);
        if !was_new {
            warn!(engine = %name, "Engine replaced in registry");
        }

        for tag in &tags {
            let engines = directory.capabilities.entry(tag.clone()).or_default();
            if !engines.contains(&name) {
                engines.push(name.clone());
            }
        }
        directory.advertised.insert(name.clone(), tags);
        directory.configs.insert(name, Arc::new(config));

        was_new
    }

    /// Unregisters an engine and removes it from every capability bucket.
    ///
    /// Buckets left empty are deleted.
    ///
    /// # Returns
    /// Returns `true` if the engine was found and removed.
    pub async fn unregister(&self, name: &str) -> bool {
        debug!(engine = %name, "Unregistering engine");
        let removed = self.directory.write().await.remove_engine(name);
        if !removed {
            warn!(engine = %name, "Attempted to unregister non-existent engine");
        }
        removed
    }

    /// Returns descriptors of live engines advertising `capability`.
    ///
    /// Registered engines that are not currently ready are filtered out. Order
    /// follows registration order.
    pub async fn find_by_capability(&self, capability: &str) -> Vec<Arc<EngineConfig>> {
        let candidates: Vec<Arc<EngineConfig>> = {
            let directory = self.directory.read().await;
            directory
                .capabilities
                .get(capability)
                .map(|names| names.iter().filter_map(|n| directory.configs.get(n).cloned()).collect())
                .unwrap_or_default()
        };

        let mut live = Vec::with_capacity(candidates.len());
        for config in candidates {
            if self.lifecycle.is_alive(&config.name).await {
                live.push(config);
            } else {
                debug!(engine = %config.name, capability = %capability, "Skipping engine that is not alive");
            }
        }
        live
    }

    /// Retrieves an engine descriptor by name.
    pub async fn get(&self, name: &str) -> Option<Arc<EngineConfig>> {
        self.directory.read().await.configs.get(name).cloned()
    }

    /// Lists every registered engine.
    pub async fn list_engines(&self) -> Vec<EngineMetadata> {
        let directory = self.directory.read().await;
        let mut engines: Vec<EngineMetadata> = directory
            .configs
            .values()
            .map(|config| EngineMetadata {
                name: config.name.clone(),
                capabilities: directory.advertised.get(&config.name).cloned().unwrap_or_default(),
                pool_size: config.pool_size,
                max_overflow: config.max_overflow,
                timeout_ms: config.timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX)),
            })
            .collect();
        engines.sort_by(|a, b| a.name.cmp(&b.name));
        engines
    }

    /// Lists every capability with at least one registered engine, sorted.
    pub async fn list_capabilities(&self) -> Vec<String> {
        self.directory.read().await.capabilities.keys().cloned().collect()
    }

    /// Returns the number of registered engines per capability.
    pub async fn capability_counts(&self) -> BTreeMap<String, usize> {
        self.directory
            .read()
            .await
            .capabilities
            .iter()
            .map(|(tag, engines)| (tag.clone(), engines.len()))
            .collect()
    }

    /// Checks if an engine is registered.
    pub async fn is_registered(&self, name: &str) -> bool {
        self.directory.read().await.configs.contains_key(name)
    }

    /// Returns the number of registered engines.
    pub async fn count(&self) -> usize {
        self.directory.read().await.configs.len()
    }
}
