//! Download seam between the cache and the network layer.
//!
//! The cache does not know about sessions or HTTP; it asks an
//! [`AssetFetcher`] to materialize an asset id into a local file and
//! only cares whether a failure is worth retrying.

use std::path::Path;

use async_trait::async_trait;

/// A failed fetch, tagged with whether retrying can help.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct FetchError {
    pub message: String,
    pub transient: bool,
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

/// Materializes an asset's bytes into `dest`.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, asset_id: &str, dest: &Path) -> Result<(), FetchError>;
}
