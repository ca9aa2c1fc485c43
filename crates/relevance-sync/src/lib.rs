//! Relevance Sync - distributed relevance model management
//!
//! Ties the coordination, store and dispatcher crates together:
//!
//! - [`DistributedStorage`]: add, delete, clear and reload models cluster-wide
//! - [`RelevanceSync`]: the per-process service wiring everything up
//! - [`http_api`]: the admin REST API

pub mod applier;
pub mod http_api;
pub mod service;
pub mod storage;

pub use applier::{CacheApplier, ModelUpdate};
pub use service::RelevanceSync;
pub use storage::DistributedStorage;
