//! Local application of model changes
//!
//! Changes made by this process and changes announced by peers are applied
//! to the cache through the same routine, under the same lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dispatcher::{split_model_payload, MessageReceiver};
use model_store::ModelCacheHandle;
use parking_lot::Mutex;
use relevance_core::{Error, FactoryHandle, MessageType, ModelCompiler, Result};
use tracing::{debug, error, warn};

/// One change to the local cache
#[derive(Debug, Clone)]
pub enum ModelUpdate {
    /// Add or replace a runtime model
    Put { name: String, factory: FactoryHandle },
    /// Drop a runtime model
    Remove { name: String },
    /// Empty both tiers
    Clear,
    /// Make the runtime tier exactly `models`
    Reload { models: HashMap<String, FactoryHandle> },
}

impl ModelUpdate {
    /// Turn a received notification into a cache change
    ///
    /// Returns `None` for message types that carry no change.
    pub fn from_message(
        compiler: &dyn ModelCompiler,
        msg_type: MessageType,
        payload: &str,
    ) -> Result<Option<Self>> {
        match msg_type {
            MessageType::Add | MessageType::Update => {
                let (name, definition) = split_model_payload(payload)?;
                let factory = compiler.compile(name, definition)?;
                Ok(Some(ModelUpdate::Put {
                    name: name.to_string(),
                    factory: Arc::new(factory),
                }))
            }
            MessageType::Del => {
                if payload.is_empty() {
                    return Err(Error::InvalidMessage {
                        message: "del message without a model name".to_string(),
                    });
                }
                Ok(Some(ModelUpdate::Remove {
                    name: payload.to_string(),
                }))
            }
            MessageType::Empty => Ok(Some(ModelUpdate::Clear)),
            MessageType::None => Ok(None),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ModelUpdate::Put { .. } => "put",
            ModelUpdate::Remove { .. } => "remove",
            ModelUpdate::Clear => "clear",
            ModelUpdate::Reload { .. } => "reload",
        }
    }
}

/// Peer changes applied while a reload was reading the store
#[derive(Debug, Default)]
struct ReloadJournal {
    cleared: bool,
    /// `None` marks a removal
    touched: HashMap<String, Option<FactoryHandle>>,
}

impl ReloadJournal {
    fn record(&mut self, update: &ModelUpdate) {
        match update {
            ModelUpdate::Put { name, factory } => {
                self.touched.insert(name.clone(), Some(Arc::clone(factory)));
            }
            ModelUpdate::Remove { name } => {
                self.touched.insert(name.clone(), None);
            }
            ModelUpdate::Clear => {
                self.cleared = true;
                self.touched.clear();
            }
            ModelUpdate::Reload { .. } => {}
        }
    }

    /// Overlay the journaled changes on a snapshot read from the store
    fn merge(self, mut models: HashMap<String, FactoryHandle>) -> HashMap<String, FactoryHandle> {
        if self.cleared {
            models.clear();
        }
        for (name, factory) in self.touched {
            match factory {
                Some(factory) => {
                    models.insert(name, factory);
                }
                None => {
                    models.remove(&name);
                }
            }
        }
        models
    }
}

/// Applies [`ModelUpdate`]s to the process cache
///
/// Registered with the dispatcher as the notification receiver. The apply
/// lock also guards the journal of a reload in progress, so a peer change
/// landing between the store read and the runtime swap survives the swap.
pub struct CacheApplier {
    cache: ModelCacheHandle,
    compiler: Arc<dyn ModelCompiler>,
    apply_lock: Mutex<Option<ReloadJournal>>,
    applied: AtomicU64,
}

impl CacheApplier {
    pub fn new(cache: ModelCacheHandle, compiler: Arc<dyn ModelCompiler>) -> Self {
        Self {
            cache,
            compiler,
            apply_lock: Mutex::new(None),
            applied: AtomicU64::new(0),
        }
    }

    /// Apply one change under the apply lock
    pub fn apply(&self, update: ModelUpdate) {
        let mut journal = self.apply_lock.lock();
        let kind = update.kind();

        if let Some(journal) = journal.as_mut() {
            journal.record(&update);
        }

        match update {
            ModelUpdate::Put { name, factory } => {
                self.cache.runtime().put(&name, factory, true);
                debug!(model = %name, "Applied model");
            }
            ModelUpdate::Remove { name } => {
                if self.cache.runtime().remove(&name).is_none() {
                    debug!(model = %name, "Model not cached, nothing to remove");
                }
            }
            ModelUpdate::Clear => self.cache.clear_all(),
            ModelUpdate::Reload { models } => {
                let models = match journal.take() {
                    Some(pending) => pending.merge(models),
                    None => models,
                };
                self.cache.runtime().replace_all(models);
            }
        }

        self.applied.fetch_add(1, Ordering::Relaxed);
        debug!(kind, "Applied cache update");
    }

    /// Start journaling updates ahead of a reload
    ///
    /// Must be followed by [`finish_reload`](Self::finish_reload) or
    /// [`cancel_reload`](Self::cancel_reload).
    pub fn begin_reload(&self) {
        *self.apply_lock.lock() = Some(ReloadJournal::default());
    }

    /// Drop the journal of a reload that will not complete
    pub fn cancel_reload(&self) {
        self.apply_lock.lock().take();
    }

    /// Swap in `models` with the journaled changes laid over them
    ///
    /// Returns the runtime tier as installed.
    pub fn finish_reload(
        &self,
        models: HashMap<String, FactoryHandle>,
    ) -> HashMap<String, FactoryHandle> {
        let mut journal = self.apply_lock.lock();
        let merged = match journal.take() {
            Some(pending) => {
                if pending.cleared || !pending.touched.is_empty() {
                    debug!(
                        cleared = pending.cleared,
                        touched = pending.touched.len(),
                        "Keeping peer changes made during reload"
                    );
                }
                pending.merge(models)
            }
            None => models,
        };

        self.cache.runtime().replace_all(merged.clone());
        self.applied.fetch_add(1, Ordering::Relaxed);
        debug!(kind = "reload", "Applied cache update");
        merged
    }

    /// Number of updates applied so far
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }
}

impl MessageReceiver for CacheApplier {
    fn on_message(&self, msg_type: MessageType, is_sender: bool, payload: &str) {
        // the sender already applied its own change
        if is_sender {
            debug!(msg_type = %msg_type, "Skipping own notification");
            return;
        }

        match ModelUpdate::from_message(self.compiler.as_ref(), msg_type, payload) {
            Ok(Some(update)) => self.apply(update),
            Ok(None) => {}
            Err(e @ Error::ModelBuild { .. }) => {
                error!(msg_type = %msg_type, error = %e, "Failed to build model from notification");
            }
            Err(e) => {
                warn!(msg_type = %msg_type, error = %e, "Ignoring unusable notification");
            }
        }
    }
}
