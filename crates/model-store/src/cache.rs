//! Process-local two-tier model cache
//!
//! `preloaded` holds models injected at startup from local configuration;
//! `runtime` holds models managed through the distributed protocol. Each tier
//! has its own lock, and every multi-step mutation of a tier runs under it,
//! so no mutator observes a partially applied bulk operation.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use relevance_core::FactoryHandle;
use tracing::debug;

/// One tier of the cache: name -> compiled model
#[derive(Debug)]
pub struct ModelTier {
    tier: &'static str,
    models: RwLock<HashMap<String, FactoryHandle>>,
}

impl ModelTier {
    fn new(tier: &'static str) -> Self {
        Self {
            tier,
            models: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a model; an existing entry is only replaced with `overwrite`
    ///
    /// Returns false on a conflict, which leaves the tier unchanged.
    pub fn put(&self, name: &str, model: FactoryHandle, overwrite: bool) -> bool {
        let mut models = self.models.write();
        if !overwrite && models.contains_key(name) {
            debug!(tier = self.tier, model = %name, "Model already cached, not overwriting");
            return false;
        }
        models.insert(name.to_string(), model);
        true
    }

    /// Insert many models at once, all or nothing
    ///
    /// Without `overwrite`, a single colliding key rejects the whole batch.
    pub fn put_all(&self, incoming: HashMap<String, FactoryHandle>, overwrite: bool) -> bool {
        let mut models = self.models.write();
        if !overwrite {
            if let Some(conflict) = incoming.keys().find(|name| models.contains_key(*name)) {
                debug!(
                    tier = self.tier,
                    model = %conflict,
                    batch = incoming.len(),
                    "Bulk insert rejected on conflict"
                );
                return false;
            }
        }
        models.extend(incoming);
        true
    }

    /// Swap the whole tier for `incoming`
    pub fn replace_all(&self, incoming: HashMap<String, FactoryHandle>) {
        let mut models = self.models.write();
        debug!(
            tier = self.tier,
            previous = models.len(),
            current = incoming.len(),
            "Replacing cached models"
        );
        *models = incoming;
    }

    /// Remove a model; absent names are a no-op
    pub fn remove(&self, name: &str) -> Option<FactoryHandle> {
        self.models.write().remove(name)
    }

    /// Remove every model
    pub fn remove_all(&self) {
        self.models.write().clear();
    }

    pub fn has(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<FactoryHandle> {
        self.models.read().get(name).cloned()
    }

    /// Sorted model names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.models.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.models.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.read().is_empty()
    }

    /// Copy of the current contents
    pub fn snapshot(&self) -> HashMap<String, FactoryHandle> {
        self.models.read().clone()
    }
}

/// Local model cache owned by one process
#[derive(Debug)]
pub struct ModelCache {
    preloaded: ModelTier,
    runtime: ModelTier,
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelCache {
    pub fn new() -> Self {
        Self {
            preloaded: ModelTier::new("preloaded"),
            runtime: ModelTier::new("runtime"),
        }
    }

    /// Models injected from local configuration
    pub fn preloaded(&self) -> &ModelTier {
        &self.preloaded
    }

    /// Models managed through the distributed protocol
    pub fn runtime(&self) -> &ModelTier {
        &self.runtime
    }

    /// Model a query should use: runtime shadows preloaded
    pub fn effective(&self, name: &str) -> Option<FactoryHandle> {
        self.runtime.get(name).or_else(|| self.preloaded.get(name))
    }

    /// Empty both tiers
    pub fn clear_all(&self) {
        self.preloaded.remove_all();
        self.runtime.remove_all();
    }
}

/// Shared handle to the process cache
pub type ModelCacheHandle = Arc<ModelCache>;
