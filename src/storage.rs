//! Writing output blobs.
//!
//! We talk to Azure Blob Storage through [`opendal`], which also gives us an
//! in-memory backend for dry runs and tests.

use opendal::{Operator, services};

use crate::prelude::*;

/// Connection string that selects the in-memory backend.
pub const MEMORY_CONNECTION_STRING: &str = "memory://";

/// Somewhere we can put blobs.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Upload `data` as `name` in `container`, replacing any existing blob.
    async fn write_blob(&self, container: &str, name: &str, data: Vec<u8>) -> Result<()>;
}

/// Which storage service we're talking to.
#[derive(Clone)]
enum Backend {
    /// Azure Blob Storage. We build one operator per container.
    Azure { connection_string: String },

    /// A single in-memory operator, with containers as top-level directories.
    Memory(Operator),
}

/// A [`BlobStore`] backed by [`opendal`].
#[derive(Clone)]
pub struct OpendalBlobStore {
    backend: Backend,
}

impl OpendalBlobStore {
    /// Create a store from a storage connection string.
    ///
    /// We check the connection string now, so that a bad one fails at
    /// startup and not after we've already paid for OCR.
    pub fn from_connection_string(connection_string: &str) -> Result<Self> {
        if connection_string == MEMORY_CONNECTION_STRING {
            return Self::memory();
        }
        let has_account = connection_string.split(';').any(|part| {
            let key = part.split_once('=').map(|(k, _)| k.trim()).unwrap_or_default();
            ["AccountName", "BlobEndpoint", "UseDevelopmentStorage"].contains(&key)
        });
        if !has_account {
            return Err(anyhow!(
                "storage connection string names no account or blob endpoint"
            ));
        }
        services::Azblob::from_connection_string(connection_string)
            .context("invalid storage connection string")?;
        Ok(Self {
            backend: Backend::Azure {
                connection_string: connection_string.to_owned(),
            },
        })
    }

    /// Create an in-memory store.
    pub fn memory() -> Result<Self> {
        let operator = Operator::new(services::Memory::default())
            .context("failed to create in-memory storage")?
            .finish();
        Ok(Self {
            backend: Backend::Memory(operator),
        })
    }

    /// Get an operator and path for a blob.
    fn locate(&self, container: &str, name: &str) -> Result<(Operator, String)> {
        match &self.backend {
            Backend::Azure { connection_string } => {
                let builder = services::Azblob::from_connection_string(connection_string)
                    .context("invalid storage connection string")?
                    .container(container);
                let operator = Operator::new(builder)
                    .with_context(|| format!("failed to open container {container:?}"))?
                    .finish();
                Ok((operator, name.to_owned()))
            }
            Backend::Memory(operator) => {
                Ok((operator.clone(), format!("{container}/{name}")))
            }
        }
    }

    /// Read a blob back.
    #[cfg(test)]
    pub async fn read_blob(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        let (operator, path) = self.locate(container, name)?;
        Ok(operator.read(&path).await?.to_vec())
    }

    /// Does a blob exist?
    #[cfg(test)]
    pub async fn blob_exists(&self, container: &str, name: &str) -> Result<bool> {
        let (operator, path) = self.locate(container, name)?;
        Ok(operator.exists(&path).await?)
    }
}

#[async_trait]
impl BlobStore for OpendalBlobStore {
    #[instrument(level = "debug", skip(self, data), fields(size = data.len()))]
    async fn write_blob(&self, container: &str, name: &str, data: Vec<u8>) -> Result<()> {
        let (operator, path) = self.locate(container, name)?;
        operator
            .write(&path, data)
            .await
            .with_context(|| format!("failed to upload {name:?} to container {container:?}"))?;
        debug!("Blob upload complete");
        Ok(())
    }
}
