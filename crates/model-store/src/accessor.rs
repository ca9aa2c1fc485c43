//! Durable model storage on the coordination service
//!
//! Every model is one child node of a root path; the child's data is the
//! zlib-compressed definition.

use std::collections::BTreeMap;

use bytes::Bytes;
use coordination::{node_path, normalize_path, CoordinationHandle};
use relevance_core::{Error, Result};
use tracing::{debug, info, instrument, warn};

use crate::codec::ModelCodec;

/// Reads and writes the persisted copy of every runtime model
pub struct ModelDataAccessor {
    client: CoordinationHandle,
    root: String,
    codec: ModelCodec,
}

impl ModelDataAccessor {
    /// Create an accessor rooted at `root_path`
    pub fn new(client: CoordinationHandle, root_path: &str, codec: ModelCodec) -> Self {
        Self {
            client,
            root: normalize_path(root_path),
            codec,
        }
    }

    /// Root node path
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Create the root node if nobody has yet
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn init(&self) -> Result<()> {
        match self.client.create_node(&self.root, Bytes::new()).await {
            Ok(()) => {
                info!("Created model root node");
                Ok(())
            }
            Err(Error::NodeExists { .. }) => {
                info!("Model root node already created by others, will not be created again");
                Ok(())
            }
            Err(e) => Err(Error::Initialization {
                message: format!("can not create model root {}: {}", self.root, e),
            }),
        }
    }

    /// Persist a model
    ///
    /// # Returns
    /// `true` if the model was created or overwritten, `false` if it already
    /// exists and `overwrite` is not set
    #[instrument(skip(self, value), fields(root = %self.root, size = value.len()))]
    pub async fn add(&self, name: &str, value: &str, overwrite: bool) -> Result<bool> {
        let children = self.client.list_children(&self.root).await?;
        let path = node_path(&self.root, name);
        let payload = self.codec.compress(value)?;

        if !children.iter().any(|child| child == name) {
            match self.client.create_node(&path, payload.clone()).await {
                Ok(()) => {
                    debug!(model = %name, "Created model node");
                    return Ok(true);
                }
                // lost a creation race against another process
                Err(Error::NodeExists { .. }) if !overwrite => {
                    warn!(model = %name, "Model already exists, has to be overwritten");
                    return Ok(false);
                }
                Err(Error::NodeExists { .. }) => {}
                Err(e) => return Err(e),
            }
        } else if !overwrite {
            warn!(model = %name, "Model already exists, has to be overwritten");
            return Ok(false);
        }

        let version = self.client.set_data(&path, payload).await?;
        debug!(model = %name, version, "Overwrote model node");
        Ok(true)
    }

    /// Remove a model; an absent model counts as removed
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let children = self.client.list_children(&self.root).await?;
        if !children.iter().any(|child| child == name) {
            debug!(model = %name, "Model not stored, nothing to remove");
            return Ok(true);
        }

        match self.client.delete_child(&self.root, name).await {
            Ok(()) | Err(Error::NoNode { .. }) => Ok(true),
            Err(e) => Err(e),
        }
    }

    /// Read every stored model, name -> definition
    ///
    /// Entries that can not be read or decoded are logged and skipped.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn list_all(&self) -> Result<BTreeMap<String, String>> {
        let children = self.client.list_children(&self.root).await?;
        let mut models = BTreeMap::new();

        for name in children {
            let path = node_path(&self.root, &name);
            let bytes = match self.client.get_data(&path).await {
                Ok(bytes) => bytes,
                Err(Error::NoNode { .. }) => {
                    debug!(model = %name, "Model removed while listing");
                    continue;
                }
                Err(e) if e.is_transport() => return Err(e),
                Err(e) => {
                    warn!(model = %name, error = %e, "Failed to read model, skipping");
                    continue;
                }
            };

            match self.codec.decompress(&bytes) {
                Ok(definition) => {
                    models.insert(name, definition);
                }
                Err(e) => {
                    warn!(model = %name, error = %e, "Failed to decode model, skipping");
                }
            }
        }

        debug!(count = models.len(), "Read stored models");
        Ok(models)
    }

    /// Delete every stored model
    ///
    /// Any failure fails the whole call; models removed concurrently by
    /// someone else count as deleted.
    #[instrument(skip(self), fields(root = %self.root))]
    pub async fn clear(&self) -> Result<bool> {
        let children = self.client.list_children(&self.root).await?;
        let count = children.len();

        for name in children {
            match self.client.delete_child(&self.root, &name).await {
                Ok(()) | Err(Error::NoNode { .. }) => {}
                Err(e) => {
                    warn!(model = %name, error = %e, "Error when deleting all the models");
                    return Err(e);
                }
            }
        }

        info!(count, "Deleted all stored models");
        Ok(true)
    }
}
