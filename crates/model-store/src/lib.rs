//! Model store - durable and local storage for relevance models
//!
//! - [`ModelDataAccessor`]: the authoritative copy, one compressed child node
//!   per model under a root path on the coordination service
//! - [`ModelCache`]: the process-local `preloaded` / `runtime` cache
//! - [`ModelCodec`]: the zlib payload codec

pub mod accessor;
pub mod cache;
pub mod codec;

pub use accessor::ModelDataAccessor;
pub use cache::{ModelCache, ModelCacheHandle, ModelTier};
pub use codec::{ModelCodec, DEFAULT_COMPRESSION_LEVEL};
