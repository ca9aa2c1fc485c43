use anyhow::Result;
use coordination::{CoordinationClient, MemoryEnsemble};
use relevance_core::{Error, JsonModelCompiler, SyncConfig};
use relevance_sync::RelevanceSync;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const SCORE: &str = r#"{"function":"return _INNER_SCORE;"}"#;

async fn start_node(
    ensemble: &MemoryEnsemble,
    reconcile: Option<Duration>,
) -> Result<Arc<RelevanceSync>> {
    let mut config = SyncConfig::default();
    config.dispatcher.rearm_backoff = Duration::from_millis(10);
    config.sync.reconcile_interval = reconcile;

    let node = RelevanceSync::start(
        config,
        Arc::new(ensemble.connect()),
        Arc::new(JsonModelCompiler::new()),
    )
    .await?;
    Ok(node)
}

#[tokio::test]
async fn test_failed_broadcast_is_reconciled() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, None).await?;
    // long interval: only an early reconcile can catch up in time
    let b = start_node(&ensemble, Some(Duration::from_secs(3600))).await?;

    // the store write goes through, the notification write does not
    ensemble.fail_writes_after(Some(1));
    let result = a.storage().add_model("m", SCORE, false).await;
    assert!(matches!(result, Err(Error::Dispatch { .. })));
    assert!(a.storage().has_model("m"));
    ensemble.fail_writes_after(None);

    // b never heard about it
    sleep(Duration::from_millis(50)).await;
    assert!(!b.storage().has_model("m"));

    // a later change from b wakes b's reconcile loop through its own failure
    ensemble.fail_writes_after(Some(1));
    let _ = b.storage().add_model("other", SCORE, false).await;
    ensemble.fail_writes_after(None);

    for _ in 0..200 {
        if b.storage().has_model("m") {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(b.storage().has_model("m"));

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unavailable_store_changes_nothing() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, None).await?;
    a.storage().add_model("m", SCORE, false).await?;

    ensemble.set_available(false);
    assert!(a.storage().del_model("m").await.is_err());
    assert!(a.storage().empty_all_models().await.is_err());
    assert!(a.storage().load_all_models().await.is_err());
    ensemble.set_available(true);

    // the local cache still matches the store
    assert!(a.storage().has_model("m"));
    let client = ensemble.connect();
    assert_eq!(client.list_children("/relevanceStore").await?, vec!["m".to_string()]);

    a.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_foreign_garbage_on_notification_node() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, None).await?;
    let b = start_node(&ensemble, None).await?;

    let client = ensemble.connect();
    client
        .set_data("/senseiMsg", "rename:someone:m1".into())
        .await?;
    client.set_data("/senseiMsg", "add:someone".into()).await?;
    sleep(Duration::from_millis(50)).await;

    // listeners are still alive afterwards
    a.storage().add_model("m", SCORE, false).await?;
    for _ in 0..200 {
        if b.storage().has_model("m") {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(b.storage().has_model("m"));

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
