//! Relevance model sync service
//!
//! Wires the cache, store, dispatcher and orchestrator over one
//! coordination session and runs the optional reconciliation loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coordination::CoordinationHandle;
use dispatcher::MessageDispatcher;
use model_store::{ModelCache, ModelCacheHandle, ModelCodec, ModelDataAccessor};
use parking_lot::Mutex;
use relevance_core::{ModelCompiler, Result, SyncConfig};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::storage::DistributedStorage;

/// One process's view of the distributed model set
pub struct RelevanceSync {
    config: SyncConfig,
    cache: ModelCacheHandle,
    dispatcher: Arc<MessageDispatcher>,
    storage: Arc<DistributedStorage>,
    shutdown_tx: broadcast::Sender<()>,
    reconcile: Mutex<Option<JoinHandle<()>>>,
}

impl RelevanceSync {
    /// Bring the service up and load the stored models
    pub async fn start(
        config: SyncConfig,
        client: CoordinationHandle,
        compiler: Arc<dyn ModelCompiler>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let cache = Arc::new(ModelCache::new());
        let mut preloaded = HashMap::with_capacity(config.preloaded.len());
        for (name, definition) in &config.preloaded {
            let factory = compiler.compile(name, &definition.to_string())?;
            preloaded.insert(name.clone(), Arc::new(factory));
        }
        let preloaded_count = preloaded.len();
        cache.preloaded().put_all(preloaded, true);

        let dispatcher = Arc::new(MessageDispatcher::new(
            Arc::clone(&client),
            &config.dispatcher,
        ));
        dispatcher.initialize().await?;

        let accessor = Arc::new(ModelDataAccessor::new(
            client,
            &config.store.root_path,
            ModelCodec::new(config.store.compression_level),
        ));
        accessor.init().await?;

        let storage = Arc::new(DistributedStorage::new(
            Arc::clone(&cache),
            accessor,
            Arc::clone(&dispatcher),
            compiler,
        )?);
        let loaded = storage.load_all_models().await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        let reconcile = config.sync.reconcile_interval.map(|interval| {
            tokio::spawn(run_reconcile_loop(
                Arc::clone(&storage),
                interval,
                storage.needs_reconcile(),
                shutdown_tx.subscribe(),
            ))
        });

        info!(
            preloaded = preloaded_count,
            runtime = loaded.len(),
            "Relevance model sync started"
        );

        Ok(Arc::new(Self {
            config,
            cache,
            dispatcher,
            storage,
            shutdown_tx,
            reconcile: Mutex::new(reconcile),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<DistributedStorage> {
        &self.storage
    }

    pub fn cache(&self) -> &ModelCacheHandle {
        &self.cache
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    /// Stop reconciling and release the coordination session
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());

        let handle = self.reconcile.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconcile loop ended abnormally");
            }
        }

        self.dispatcher.shutdown().await;
        info!("Relevance model sync shut down");
    }
}

/// Reload from the durable store every `interval`, or early when a
/// broadcast failed
async fn run_reconcile_loop(
    storage: Arc<DistributedStorage>,
    interval: Duration,
    needs_reconcile: Arc<Notify>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!(
        interval_ms = interval.as_millis() as u64,
        "Starting reconcile loop"
    );

    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = needs_reconcile.notified() => {
                info!("Reconciling early after a failed broadcast");
            }
            _ = shutdown_rx.recv() => {
                info!("Reconcile loop shutting down");
                break;
            }
        }

        match storage.load_all_models().await {
            Ok(models) => debug!(count = models.len(), "Reconciled models"),
            Err(e) => warn!(error = %e, "Reconcile failed, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordination::MemoryEnsemble;
    use relevance_core::{Error, JsonModelCompiler};
    use serde_json::json;

    const DEF: &str = r#"{"function":"return _INNER_SCORE;"}"#;

    fn config() -> SyncConfig {
        let mut config = SyncConfig::default();
        config.dispatcher.rearm_backoff = Duration::from_millis(10);
        config
    }

    async fn start(ensemble: &MemoryEnsemble, config: SyncConfig) -> Result<Arc<RelevanceSync>> {
        RelevanceSync::start(
            config,
            Arc::new(ensemble.connect()),
            Arc::new(JsonModelCompiler::new()),
        )
        .await
    }

    #[tokio::test]
    async fn test_start_loads_stored_models() {
        let ensemble = MemoryEnsemble::new();
        let first = start(&ensemble, config()).await.unwrap();
        first.storage().add_model("m", DEF, false).await.unwrap();

        let second = start(&ensemble, config()).await.unwrap();
        assert!(second.cache().runtime().has("m"));

        first.shutdown().await;
        second.shutdown().await;
    }

    #[tokio::test]
    async fn test_preloaded_models_are_injected() {
        let ensemble = MemoryEnsemble::new();
        let mut config = config();
        config
            .preloaded
            .insert("p".to_string(), json!({"function": "return 1;"}));

        let sync = start(&ensemble, config).await.unwrap();
        assert!(sync.cache().preloaded().has("p"));
        assert!(sync.cache().runtime().is_empty());
        assert_eq!(sync.storage().get_model("p").unwrap().function(), "return 1;");
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_preloaded_model_fails_start() {
        let ensemble = MemoryEnsemble::new();
        let mut config = config();
        config.preloaded.insert("p".to_string(), json!({"no": "function"}));

        let result = start(&ensemble, config).await;
        assert!(matches!(result, Err(Error::ModelBuild { .. })));
    }

    #[tokio::test]
    async fn test_start_fails_when_unreachable() {
        let ensemble = MemoryEnsemble::new();
        ensemble.set_available(false);

        let result = start(&ensemble, config()).await;
        assert!(matches!(result, Err(Error::Initialization { .. })));
    }

    #[tokio::test]
    async fn test_reconcile_loop_picks_up_missed_changes() {
        let ensemble = MemoryEnsemble::new();
        let mut reconciling = config();
        reconciling.sync.reconcile_interval = Some(Duration::from_millis(20));
        let sync = start(&ensemble, reconciling).await.unwrap();

        // written straight to the store, no notification
        let accessor = ModelDataAccessor::new(
            Arc::new(ensemble.connect()),
            "/relevanceStore",
            ModelCodec::default(),
        );
        accessor.add("m", DEF, false).await.unwrap();

        let mut seen = false;
        for _ in 0..100 {
            if sync.cache().runtime().has("m") {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(seen);
        sync.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let ensemble = MemoryEnsemble::new();
        let mut reconciling = config();
        reconciling.sync.reconcile_interval = Some(Duration::from_secs(60));
        let sync = start(&ensemble, reconciling).await.unwrap();

        sync.shutdown().await;
        sync.shutdown().await;
    }
}
