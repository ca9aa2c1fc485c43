//! In-memory coordination service
//!
//! A single shared tree of versioned nodes with one-shot watches. Each
//! [`MemorySession`] stands in for one process's connection, so several
//! simulated processes can coordinate through one [`MemoryEnsemble`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use relevance_core::{Error, Result};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, instrument};

use crate::client::{validate_path, CoordinationClient, NodeStat, Watch, WatchEvent};

/// Session operations that can be paused with [`MemoryEnsemble::hold`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeldOp {
    GetData,
    ListChildren,
    Watch,
}

/// One paused operation
///
/// The operation runs against the tree as usual, then waits for
/// [`OpHold::release`] before returning its result.
#[derive(Debug, Default)]
pub struct OpHold {
    entered: Notify,
    released: Notify,
}

impl OpHold {
    /// Wait until a session reaches the held operation
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let the held operation return
    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Operation counters, for tests and diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnsembleStats {
    pub creates: u64,
    pub sets: u64,
    pub deletes: u64,
    pub reads: u64,
    pub watches_fired: u64,
    /// Watch registrations refused by [`MemoryEnsemble::fail_next_watches`]
    pub watch_failures: u64,
}

#[derive(Debug)]
struct Node {
    data: Bytes,
    version: u64,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: Bytes) -> Self {
        Self {
            data,
            version: 0,
            children: BTreeSet::new(),
        }
    }
}

struct Registration {
    session: u64,
    tx: oneshot::Sender<WatchEvent>,
}

struct EnsembleState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<Registration>>,
    available: bool,
    write_budget: Option<u64>,
    failing_watches: u64,
    holds: HashMap<(HeldOp, String), Arc<OpHold>>,
    next_session: u64,
    stats: EnsembleStats,
}

impl EnsembleState {
    fn check_available(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(Error::ConnectionLoss)
        }
    }

    fn consume_write(&mut self) -> Result<()> {
        self.check_available()?;
        match self.write_budget.as_mut() {
            Some(0) => Err(Error::ConnectionLoss),
            Some(remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn fire(&mut self, path: &str, event: WatchEvent) {
        if let Some(registrations) = self.watches.remove(path) {
            for registration in registrations {
                if registration.tx.send(event).is_ok() {
                    self.stats.watches_fired += 1;
                }
            }
        }
    }

    fn node(&self, path: &str) -> Result<&Node> {
        self.nodes.get(path).ok_or_else(|| Error::NoNode {
            path: path.to_string(),
        })
    }

    fn write_data(&mut self, path: &str, data: Bytes, expected: Option<u64>) -> Result<u64> {
        let node = self.nodes.get(path).ok_or_else(|| Error::NoNode {
            path: path.to_string(),
        })?;

        if let Some(expected) = expected {
            if node.version != expected {
                return Err(Error::BadVersion {
                    path: path.to_string(),
                    expected,
                    actual: node.version,
                });
            }
        }

        self.consume_write()?;

        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| Error::NoNode {
                path: path.to_string(),
            })?;
        node.data = data;
        node.version += 1;
        let version = node.version;

        self.stats.sets += 1;
        self.fire(path, WatchEvent::NodeDataChanged);
        Ok(version)
    }
}

fn split_parent(path: &str) -> Result<(&str, &str)> {
    let idx = path.rfind('/').ok_or_else(|| Error::Coordination {
        message: format!("invalid path {:?}", path),
    })?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Ok((parent, &path[idx + 1..]))
}

/// Shared in-memory coordination service
#[derive(Clone)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<EnsembleState>>,
}

impl Default for MemoryEnsemble {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEnsemble {
    /// Create an empty ensemble holding only the root node
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new(Bytes::new()));
        Self {
            state: Arc::new(Mutex::new(EnsembleState {
                nodes,
                watches: HashMap::new(),
                available: true,
                write_budget: None,
                failing_watches: 0,
                holds: HashMap::new(),
                next_session: 1,
                stats: EnsembleStats::default(),
            })),
        }
    }

    /// Open a new session
    pub fn connect(&self) -> MemorySession {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_session;
            state.next_session += 1;
            id
        };
        debug!(session = id, "Opened in-memory coordination session");
        MemorySession {
            id,
            state: Arc::clone(&self.state),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every operation fail with `Error::ConnectionLoss` while false
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Let the next `n` writes succeed and fail every write after that;
    /// `None` removes the limit
    pub fn fail_writes_after(&self, n: Option<u64>) {
        self.state.lock().write_budget = n;
    }

    /// Refuse the next `n` watch registrations with `Error::ConnectionLoss`
    pub fn fail_next_watches(&self, n: u64) {
        self.state.lock().failing_watches = n;
    }

    /// Pause the next `op` on `path`, from any session, after it ran
    pub fn hold(&self, op: HeldOp, path: &str) -> Arc<OpHold> {
        let hold = Arc::new(OpHold::default());
        self.state
            .lock()
            .holds
            .insert((op, path.to_string()), Arc::clone(&hold));
        hold
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> EnsembleStats {
        self.state.lock().stats
    }

    /// Number of watches currently registered on a path
    pub fn pending_watches(&self, path: &str) -> usize {
        self.state
            .lock()
            .watches
            .get(path)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

/// One session against a [`MemoryEnsemble`]
pub struct MemorySession {
    id: u64,
    state: Arc<Mutex<EnsembleState>>,
    closed: AtomicBool,
}

impl MemorySession {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    async fn pause_if_held(&self, op: HeldOp, path: &str) {
        let hold = self.state.lock().holds.remove(&(op, path.to_string()));
        if let Some(hold) = hold {
            debug!(session = self.id, ?op, path, "Holding operation");
            hold.entered.notify_one();
            hold.released.notified().await;
        }
    }

    fn read_data(&self, path: &str) -> Result<Bytes> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.check_available()?;
        let data = state.node(path)?.data.clone();
        state.stats.reads += 1;
        Ok(data)
    }

    fn read_children(&self, path: &str) -> Result<Vec<String>> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.check_available()?;
        let children = state.node(path)?.children.iter().cloned().collect();
        state.stats.reads += 1;
        Ok(children)
    }

    fn register_watch(&self, path: &str) -> Result<Watch> {
        self.check_open()?;
        validate_path(path)?;

        let mut state = self.state.lock();
        state.check_available()?;

        if state.failing_watches > 0 {
            state.failing_watches -= 1;
            state.stats.watch_failures += 1;
            return Err(Error::ConnectionLoss);
        }

        let (tx, watch) = Watch::channel();
        state
            .watches
            .entry(path.to_string())
            .or_default()
            .push(Registration {
                session: self.id,
                tx,
            });
        Ok(watch)
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    #[instrument(skip(self, data), fields(session = self.id, size = data.len()))]
    async fn create_node(&self, path: &str, data: Bytes) -> Result<()> {
        self.check_open()?;
        validate_path(path)?;
        let (parent, name) = split_parent(path)?;

        let mut state = self.state.lock();
        state.check_available()?;

        if state.nodes.contains_key(path) {
            return Err(Error::NodeExists {
                path: path.to_string(),
            });
        }
        if !state.nodes.contains_key(parent) {
            return Err(Error::NoNode {
                path: parent.to_string(),
            });
        }

        state.consume_write()?;

        state.nodes.insert(path.to_string(), Node::new(data));
        if let Some(parent_node) = state.nodes.get_mut(parent) {
            parent_node.children.insert(name.to_string());
        }

        state.stats.creates += 1;
        state.fire(path, WatchEvent::NodeCreated);
        Ok(())
    }

    async fn get_data(&self, path: &str) -> Result<Bytes> {
        let result = self.read_data(path);
        self.pause_if_held(HeldOp::GetData, path).await;
        result
    }

    async fn stat(&self, path: &str) -> Result<NodeStat> {
        self.check_open()?;
        let state = self.state.lock();
        state.check_available()?;
        let node = state.node(path)?;
        Ok(NodeStat {
            version: node.version,
            num_children: node.children.len(),
        })
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_open()?;
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.nodes.contains_key(path))
    }

    #[instrument(skip(self, data), fields(session = self.id, size = data.len()))]
    async fn set_data(&self, path: &str, data: Bytes) -> Result<u64> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.check_available()?;
        state.write_data(path, data, None)
    }

    async fn compare_and_set(
        &self,
        path: &str,
        data: Bytes,
        expected_version: u64,
    ) -> Result<u64> {
        self.check_open()?;
        let mut state = self.state.lock();
        state.check_available()?;
        state.write_data(path, data, Some(expected_version))
    }

    async fn list_children(&self, path: &str) -> Result<Vec<String>> {
        let result = self.read_children(path);
        self.pause_if_held(HeldOp::ListChildren, path).await;
        result
    }

    #[instrument(skip(self), fields(session = self.id))]
    async fn delete_child(&self, parent: &str, name: &str) -> Result<()> {
        self.check_open()?;
        let path = crate::client::node_path(parent, name);
        validate_path(&path)?;

        let mut state = self.state.lock();
        state.check_available()?;

        let node = state.node(&path)?;
        if !node.children.is_empty() {
            return Err(Error::NotEmpty { path });
        }

        state.consume_write()?;

        state.nodes.remove(&path);
        if let Some(parent_node) = state.nodes.get_mut(parent) {
            parent_node.children.remove(name);
        }

        state.stats.deletes += 1;
        state.fire(&path, WatchEvent::NodeDeleted);
        Ok(())
    }

    async fn watch(&self, path: &str) -> Result<Watch> {
        let result = self.register_watch(path);
        self.pause_if_held(HeldOp::Watch, path).await;
        result
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock();
        for registrations in state.watches.values_mut() {
            let (mine, others): (Vec<_>, Vec<_>) = registrations
                .drain(..)
                .partition(|r| r.session == self.id);
            *registrations = others;
            for registration in mine {
                let _ = registration.tx.send(WatchEvent::SessionClosed);
            }
        }
        state.watches.retain(|_, registrations| !registrations.is_empty());
        debug!(session = self.id, "Closed in-memory coordination session");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (MemoryEnsemble, MemorySession) {
        let ensemble = MemoryEnsemble::new();
        let session = ensemble.connect();
        (ensemble, session)
    }

    #[tokio::test]
    async fn test_create_and_read() {
        let (_ensemble, session) = setup();

        session
            .create_node("/models", Bytes::from_static(b"root"))
            .await
            .unwrap();
        assert_eq!(session.get_data("/models").await.unwrap(), "root");
        assert!(session.exists("/models").await.unwrap());
        assert!(!session.exists("/missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_existing_node() {
        let (_ensemble, session) = setup();

        session.create_node("/models", Bytes::new()).await.unwrap();
        let result = session.create_node("/models", Bytes::new()).await;
        assert!(matches!(result, Err(Error::NodeExists { .. })));
    }

    #[tokio::test]
    async fn test_create_without_parent() {
        let (_ensemble, session) = setup();

        let result = session.create_node("/models/m1", Bytes::new()).await;
        assert!(matches!(result, Err(Error::NoNode { .. })));
    }

    #[tokio::test]
    async fn test_children_and_delete() {
        let (_ensemble, session) = setup();

        session.create_node("/models", Bytes::new()).await.unwrap();
        session.create_node("/models/b", Bytes::new()).await.unwrap();
        session.create_node("/models/a", Bytes::new()).await.unwrap();

        assert_eq!(session.list_children("/models").await.unwrap(), ["a", "b"]);
        assert_eq!(session.stat("/models").await.unwrap().num_children, 2);

        let result = session.delete_child("/", "models").await;
        assert!(matches!(result, Err(Error::NotEmpty { .. })));

        session.delete_child("/models", "a").await.unwrap();
        assert_eq!(session.list_children("/models").await.unwrap(), ["b"]);

        let result = session.delete_child("/models", "a").await;
        assert!(matches!(result, Err(Error::NoNode { .. })));
    }

    #[tokio::test]
    async fn test_versions_and_compare_and_set() {
        let (_ensemble, session) = setup();

        session.create_node("/n", Bytes::new()).await.unwrap();
        assert_eq!(session.set_data("/n", Bytes::from("v1")).await.unwrap(), 1);

        let result = session.compare_and_set("/n", Bytes::from("v2"), 0).await;
        assert!(matches!(
            result,
            Err(Error::BadVersion {
                expected: 0,
                actual: 1,
                ..
            })
        ));

        assert_eq!(
            session
                .compare_and_set("/n", Bytes::from("v2"), 1)
                .await
                .unwrap(),
            2
        );
        assert_eq!(session.get_data("/n").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_watch_fires_once_across_sessions() {
        let (ensemble, writer) = setup();
        let reader = ensemble.connect();

        writer.create_node("/msg", Bytes::new()).await.unwrap();
        let watch = reader.watch("/msg").await.unwrap();

        writer.set_data("/msg", Bytes::from("one")).await.unwrap();
        assert_eq!(watch.await, WatchEvent::NodeDataChanged);

        writer.set_data("/msg", Bytes::from("two")).await.unwrap();
        assert_eq!(ensemble.stats().watches_fired, 1);
    }

    #[tokio::test]
    async fn test_watch_on_missing_node_fires_on_create() {
        let (_ensemble, session) = setup();

        let watch = session.watch("/later").await.unwrap();
        session.create_node("/later", Bytes::new()).await.unwrap();
        assert_eq!(watch.await, WatchEvent::NodeCreated);
    }

    #[tokio::test]
    async fn test_close_resolves_pending_watches() {
        let (ensemble, session) = setup();
        let other = ensemble.connect();

        let mine = session.watch("/msg").await.unwrap();
        let _theirs = other.watch("/msg").await.unwrap();

        session.close().await;
        assert_eq!(mine.await, WatchEvent::SessionClosed);
        assert_eq!(ensemble.pending_watches("/msg"), 1);

        let result = session.get_data("/").await;
        assert!(matches!(result, Err(Error::SessionClosed)));

        // second close is a no-op
        session.close().await;
    }

    #[tokio::test]
    async fn test_unavailable_ensemble() {
        let (ensemble, session) = setup();

        ensemble.set_available(false);
        let result = session.create_node("/n", Bytes::new()).await;
        assert!(matches!(result, Err(Error::ConnectionLoss)));

        ensemble.set_available(true);
        session.create_node("/n", Bytes::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_held_read_returns_after_release() {
        let (ensemble, session) = setup();
        session.create_node("/n", Bytes::from("v1")).await.unwrap();
        let hold = ensemble.hold(HeldOp::GetData, "/n");

        let reader = tokio::spawn(async move { session.get_data("/n").await });
        hold.entered().await;
        assert!(!reader.is_finished());

        // the held read already ran, later writes do not change its result
        ensemble.connect().set_data("/n", Bytes::from("v2")).await.unwrap();
        hold.release();
        assert_eq!(reader.await.unwrap().unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_failing_watches_recover() {
        let (ensemble, session) = setup();
        ensemble.fail_next_watches(2);

        assert!(matches!(session.watch("/n").await, Err(Error::ConnectionLoss)));
        assert!(matches!(session.watch("/n").await, Err(Error::ConnectionLoss)));
        session.watch("/n").await.unwrap();

        assert_eq!(ensemble.stats().watch_failures, 2);
        assert_eq!(ensemble.pending_watches("/n"), 1);
    }

    #[tokio::test]
    async fn test_write_budget() {
        let (ensemble, session) = setup();

        ensemble.fail_writes_after(Some(1));
        session.create_node("/a", Bytes::new()).await.unwrap();
        let result = session.create_node("/b", Bytes::new()).await;
        assert!(matches!(result, Err(Error::ConnectionLoss)));

        // reads are unaffected
        assert!(session.exists("/a").await.unwrap());
        assert_eq!(ensemble.stats().creates, 1);
    }

    #[tokio::test]
    async fn test_pending_watch_does_not_fire_without_change() {
        let (_ensemble, session) = setup();
        session.create_node("/msg", Bytes::new()).await.unwrap();
        let watch = session.watch("/msg").await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(20), watch).await;
        assert!(result.is_err());
    }
}
