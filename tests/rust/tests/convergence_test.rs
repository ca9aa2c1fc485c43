use anyhow::Result;
use coordination::{CoordinationClient, MemoryEnsemble};
use relevance_core::{JsonModelCompiler, SyncConfig};
use relevance_sync::RelevanceSync;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const SCORE: &str = r#"{"function_params":["_INNER_SCORE"],"function":"return _INNER_SCORE;"}"#;
const DOUBLE: &str = r#"{"function_params":["_INNER_SCORE"],"function":"return 2 * _INNER_SCORE;"}"#;

fn config(host: &str) -> SyncConfig {
    let mut config = SyncConfig::default();
    config.dispatcher.host_id = Some(host.to_string());
    config.dispatcher.rearm_backoff = Duration::from_millis(10);
    config
}

// Each node gets its own session, like a separate process would
async fn start_node(ensemble: &MemoryEnsemble, host: &str) -> Result<Arc<RelevanceSync>> {
    let node = RelevanceSync::start(
        config(host),
        Arc::new(ensemble.connect()),
        Arc::new(JsonModelCompiler::new()),
    )
    .await?;
    Ok(node)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) -> Result<()> {
    for _ in 0..200 {
        if check() {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    anyhow::bail!("timed out waiting for {}", what)
}

fn function_of(node: &RelevanceSync, name: &str) -> Option<String> {
    node.storage()
        .get_model(name)
        .map(|factory| factory.function().to_string())
}

#[tokio::test]
async fn test_three_nodes_converge() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, "node-a").await?;
    let b = start_node(&ensemble, "node-b").await?;
    let c = start_node(&ensemble, "node-c").await?;

    // 1. add on A shows up everywhere
    assert!(a.storage().add_model("m", SCORE, false).await?);
    wait_until("add on b and c", || {
        b.storage().has_model("m") && c.storage().has_model("m")
    })
    .await?;
    assert_eq!(b.storage().get_model("m"), a.storage().get_model("m"));

    // 2. update from B reaches A and C
    assert!(b.storage().add_model("m", DOUBLE, true).await?);
    wait_until("update on a and c", || {
        function_of(&a, "m").as_deref() == Some("return 2 * _INNER_SCORE;")
            && function_of(&c, "m").as_deref() == Some("return 2 * _INNER_SCORE;")
    })
    .await?;

    // 3. delete from C
    assert!(c.storage().del_model("m").await?);
    wait_until("delete on a and b", || {
        !a.storage().has_model("m") && !b.storage().has_model("m")
    })
    .await?;

    for node in [&a, &b, &c] {
        node.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_sender_does_not_reapply() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, "node-a").await?;
    let b = start_node(&ensemble, "node-b").await?;

    // a's bootstrap reload is the first apply
    let before = a.storage().applier().applied_count();
    a.storage().add_model("m", SCORE, false).await?;
    wait_until("add on b", || b.storage().has_model("m")).await?;
    sleep(Duration::from_millis(50)).await;

    assert_eq!(a.storage().applier().applied_count(), before + 1);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_late_joiner_bootstraps_from_store() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, "node-a").await?;
    a.storage().add_model("m1", SCORE, false).await?;
    a.storage().add_model("m2", DOUBLE, false).await?;

    let late = start_node(&ensemble, "node-late").await?;
    assert_eq!(
        late.cache().runtime().names(),
        vec!["m1".to_string(), "m2".to_string()]
    );

    a.shutdown().await;
    late.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_empty_clears_every_node() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, "node-a").await?;
    let b = start_node(&ensemble, "node-b").await?;

    a.storage().add_model("m1", SCORE, false).await?;
    wait_until("add on b", || b.storage().has_model("m1")).await?;

    assert!(b.storage().empty_all_models().await?);
    wait_until("empty on a", || a.storage().model_names().is_empty()).await?;

    let client = ensemble.connect();
    assert!(client.list_children("/relevanceStore").await?.is_empty());

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_adds_on_one_node() -> Result<()> {
    let ensemble = MemoryEnsemble::new();
    let a = start_node(&ensemble, "node-a").await?;

    let mut handles = Vec::new();
    for i in 0..8 {
        let node = Arc::clone(&a);
        handles.push(tokio::spawn(async move {
            node.storage()
                .add_model(&format!("m{}", i), SCORE, false)
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await??);
    }

    assert_eq!(a.cache().runtime().len(), 8);
    let b = start_node(&ensemble, "node-b").await?;
    assert_eq!(b.cache().runtime().len(), 8);

    a.shutdown().await;
    b.shutdown().await;
    Ok(())
}
