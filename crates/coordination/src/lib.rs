//! Coordination - Client interface to the shared coordination service
//!
//! Provides the hierarchical, versioned, watchable key/byte-value store
//! contract the relevance sync layer is built on:
//! - [`CoordinationClient`]: the session trait (create, read, write, list,
//!   delete, one-shot watch)
//! - [`MemoryEnsemble`]: an in-process implementation for standalone nodes
//!   and tests
//!
//! # Example
//!
//! ```no_run
//! use coordination::{CoordinationClient, MemoryEnsemble};
//! use bytes::Bytes;
//!
//! # async fn example() -> relevance_core::Result<()> {
//! let ensemble = MemoryEnsemble::new();
//! let session = ensemble.connect();
//! session.create_node("/senseiMsg", Bytes::from("none")).await?;
//! let watch = session.watch("/senseiMsg").await?;
//! session.set_data("/senseiMsg", Bytes::from("add:me:m1")).await?;
//! let _event = watch.await;
//! # Ok(())
//! # }
//! ```

mod client;
mod memory;

pub use client::{
    node_path, normalize_path, validate_path, CoordinationClient, NodeStat, Watch, WatchEvent,
};
pub use memory::{EnsembleStats, HeldOp, MemoryEnsemble, MemorySession, OpHold};

/// Shared handle to a coordination session
pub type CoordinationHandle = std::sync::Arc<dyn CoordinationClient>;
