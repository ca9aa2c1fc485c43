//! Coordination client trait definition
//!
//! Defines the async interface to the hierarchical key/byte-value store the
//! rest of the workspace coordinates through.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use relevance_core::{Error, Result};
use tokio::sync::oneshot;

/// Metadata of a stored node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStat {
    /// Data version, bumped on every write
    pub version: u64,

    /// Number of direct children
    pub num_children: usize,
}

/// What caused a watch to fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    NodeCreated,
    NodeDataChanged,
    NodeDeleted,
    /// The session ended before the node changed
    SessionClosed,
}

/// One-shot change notification for a single node
///
/// Resolves at most once. Interest must be registered again with
/// [`CoordinationClient::watch`] to observe the next change.
#[derive(Debug)]
pub struct Watch {
    rx: oneshot::Receiver<WatchEvent>,
}

impl Watch {
    /// Create a watch and the sender that fires it
    pub fn channel() -> (oneshot::Sender<WatchEvent>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for Watch {
    type Output = WatchEvent;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|fired| fired.unwrap_or(WatchEvent::SessionClosed))
    }
}

/// Async trait for coordination service sessions
///
/// One session per process, shared by every component through
/// `Arc<dyn CoordinationClient>`; implementations must be safe for
/// concurrent use.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Identifier of this session, for logging
    fn session_id(&self) -> u64;

    /// Create a node with initial data
    ///
    /// # Errors
    /// `Error::NodeExists` if the path is taken, `Error::NoNode` if the
    /// parent does not exist
    async fn create_node(&self, path: &str, data: Bytes) -> Result<()>;

    /// Read the data of a node
    ///
    /// # Errors
    /// `Error::NoNode` if the path does not exist
    async fn get_data(&self, path: &str) -> Result<Bytes>;

    /// Read node metadata
    async fn stat(&self, path: &str) -> Result<NodeStat>;

    /// Check if a node exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Overwrite the data of a node unconditionally
    ///
    /// # Returns
    /// The new data version
    async fn set_data(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Overwrite the data of a node if its version still matches
    ///
    /// # Errors
    /// `Error::BadVersion` if another writer got there first
    async fn compare_and_set(&self, path: &str, data: Bytes, expected_version: u64)
        -> Result<u64>;

    /// List the names of the direct children of a node, sorted
    async fn list_children(&self, path: &str) -> Result<Vec<String>>;

    /// Delete the child `name` of `parent`
    ///
    /// # Errors
    /// `Error::NoNode` if absent, `Error::NotEmpty` if the child has children
    async fn delete_child(&self, parent: &str, name: &str) -> Result<()>;

    /// Register a one-shot watch on creation, data change or deletion of a node
    ///
    /// The node does not need to exist.
    async fn watch(&self, path: &str) -> Result<Watch>;

    /// Release the session
    ///
    /// Pending watches resolve with `WatchEvent::SessionClosed`; later calls
    /// fail with `Error::SessionClosed`. Idempotent.
    async fn close(&self);
}

/// Ensure a path starts with `/` and has no trailing `/`
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Join a parent path and a child name
pub fn node_path(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Reject paths that are not absolute, canonical node paths
pub fn validate_path(path: &str) -> Result<()> {
    let bad = |reason: &str| Error::Coordination {
        message: format!("invalid path {:?}: {}", path, reason),
    };

    if !path.starts_with('/') {
        return Err(bad("must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(bad("must not end with '/'"));
    }
    if path[1..].split('/').any(|segment| segment.is_empty()) {
        return Err(bad("empty path segment"));
    }
    Ok(())
}
