//! Distributed model storage
//!
//! Every mutation goes durable store first, then local cache, then peers.
//! Mutating calls are serialized per process by the ordering lock; the
//! local-apply step additionally takes the applier's lock, which the
//! notification path also uses. Locks are always taken ordering -> apply.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use dispatcher::{model_payload, MessageDispatcher};
use model_store::{ModelCacheHandle, ModelDataAccessor};
use relevance_core::{
    validate_model_name, FactoryHandle, MessageType, ModelCompiler, Result,
};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, instrument, warn};

use crate::applier::{CacheApplier, ModelUpdate};

/// Keeps every process's runtime models in step with the durable store
pub struct DistributedStorage {
    cache: ModelCacheHandle,
    accessor: Arc<ModelDataAccessor>,
    dispatcher: Arc<MessageDispatcher>,
    compiler: Arc<dyn ModelCompiler>,
    applier: Arc<CacheApplier>,
    ordering: Mutex<()>,
    needs_reconcile: Arc<Notify>,
}

impl DistributedStorage {
    /// Wire the storage and register it for peer notifications
    ///
    /// The dispatcher must already be initialized.
    pub fn new(
        cache: ModelCacheHandle,
        accessor: Arc<ModelDataAccessor>,
        dispatcher: Arc<MessageDispatcher>,
        compiler: Arc<dyn ModelCompiler>,
    ) -> Result<Self> {
        let applier = Arc::new(CacheApplier::new(Arc::clone(&cache), Arc::clone(&compiler)));
        dispatcher.register_receiver(applier.clone())?;

        Ok(Self {
            cache,
            accessor,
            dispatcher,
            compiler,
            applier,
            ordering: Mutex::new(()),
            needs_reconcile: Arc::new(Notify::new()),
        })
    }

    /// Add a model, or replace it with `overwrite`
    ///
    /// # Returns
    /// `true` if the model is stored with this definition, `false` if a
    /// different model already exists under `name` and `overwrite` is not set
    ///
    /// # Errors
    /// - `Error::InvalidModelName` / `Error::ModelBuild`: nothing was stored
    /// - transport errors: nothing was applied or broadcast
    /// - `Error::Dispatch`: stored and applied here, peers not notified
    #[instrument(skip(self, definition), fields(model = %name, overwrite))]
    pub async fn add_model(&self, name: &str, definition: &str, overwrite: bool) -> Result<bool> {
        validate_model_name(name)?;
        let factory = Arc::new(self.compiler.compile(name, definition)?);

        let _ordering = self.ordering.lock().await;

        if let Some(existing) = self.cache.runtime().get(name) {
            if *existing == *factory {
                debug!("Model already cached with the same definition");
                return Ok(true);
            }
        }

        if !self.accessor.add(name, definition, overwrite).await? {
            warn!("Model exists, not stored");
            return Ok(false);
        }

        self.applier.apply(ModelUpdate::Put {
            name: name.to_string(),
            factory,
        });

        let msg_type = if overwrite {
            MessageType::Update
        } else {
            MessageType::Add
        };
        self.broadcast(msg_type, &model_payload(name, definition)).await?;

        info!("Model stored");
        Ok(true)
    }

    /// Delete a runtime model; absent models count as deleted
    #[instrument(skip(self), fields(model = %name))]
    pub async fn del_model(&self, name: &str) -> Result<bool> {
        let _ordering = self.ordering.lock().await;

        if !self.cache.runtime().has(name) {
            debug!("Model not cached, nothing to delete");
            return Ok(true);
        }

        if !self.accessor.remove(name).await? {
            return Ok(false);
        }

        self.applier.apply(ModelUpdate::Remove {
            name: name.to_string(),
        });
        self.broadcast(MessageType::Del, name).await?;

        info!("Model deleted");
        Ok(true)
    }

    /// Delete every model everywhere, preloaded ones included
    #[instrument(skip(self))]
    pub async fn empty_all_models(&self) -> Result<bool> {
        let _ordering = self.ordering.lock().await;

        if !self.accessor.clear().await? {
            return Ok(false);
        }

        self.applier.apply(ModelUpdate::Clear);
        self.broadcast(MessageType::Empty, "").await?;

        info!("All models deleted");
        Ok(true)
    }

    /// Rebuild the runtime tier from the durable store
    ///
    /// Models that fail to compile are logged and left out. Peer changes
    /// applied while the store is being read are kept on top of what was
    /// read. Nothing is broadcast.
    #[instrument(skip(self))]
    pub async fn load_all_models(&self) -> Result<HashMap<String, FactoryHandle>> {
        let _ordering = self.ordering.lock().await;

        self.applier.begin_reload();
        let stored = match self.accessor.list_all().await {
            Ok(stored) => stored,
            Err(e) => {
                self.applier.cancel_reload();
                return Err(e);
            }
        };

        let mut models = HashMap::with_capacity(stored.len());
        for (name, definition) in stored {
            match self.compiler.compile(&name, &definition) {
                Ok(factory) => {
                    models.insert(name, Arc::new(factory));
                }
                Err(e) => warn!(model = %name, error = %e, "Failed to build stored model, skipping"),
            }
        }

        let models = self.applier.finish_reload(models);
        info!(count = models.len(), "Loaded models from store");
        Ok(models)
    }

    /// Effective model under `name`, runtime first
    pub fn get_model(&self, name: &str) -> Option<FactoryHandle> {
        self.cache.effective(name)
    }

    pub fn has_model(&self, name: &str) -> bool {
        self.cache.runtime().has(name) || self.cache.preloaded().has(name)
    }

    /// Sorted names across both tiers
    pub fn model_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .cache
            .runtime()
            .names()
            .into_iter()
            .chain(self.cache.preloaded().names())
            .collect();
        names.into_iter().collect()
    }

    pub fn cache(&self) -> &ModelCacheHandle {
        &self.cache
    }

    pub fn applier(&self) -> &Arc<CacheApplier> {
        &self.applier
    }

    /// Signalled whenever a broadcast fails and peers may be stale
    pub fn needs_reconcile(&self) -> Arc<Notify> {
        Arc::clone(&self.needs_reconcile)
    }

    async fn broadcast(&self, msg_type: MessageType, payload: &str) -> Result<()> {
        if let Err(e) = self.dispatcher.dispatch(msg_type, payload).await {
            error!(
                msg_type = %msg_type,
                error = %e,
                "Failed to broadcast change, peers may be stale until reconciled"
            );
            self.needs_reconcile.notify_one();
            return Err(e);
        }
        Ok(())
    }
}
