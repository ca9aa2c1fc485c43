//! Relevance Core - Foundation for relevance model synchronization
//!
//! Provides the shared error type, configuration, message types and the
//! model compile interface used by the coordination, store, dispatcher and
//! orchestrator crates.

pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod types;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use model::{FactoryHandle, JsonModelCompiler, ModelCompiler, RelevanceFunctionFactory};
pub use types::*;
