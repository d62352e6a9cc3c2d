//! Bridges the asset cache onto the dispatch server.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use shepherd_cache::{AssetFetcher, FetchError};
use shepherd_dispatch::{DispatchError, DispatchService, SessionManager};

/// [`AssetFetcher`] that downloads through the dispatch API using the
/// shared session.
pub struct DispatchFetcher {
    service: Arc<dyn DispatchService>,
    session: Arc<SessionManager>,
}

impl DispatchFetcher {
    pub fn new(service: Arc<dyn DispatchService>, session: Arc<SessionManager>) -> Arc<Self> {
        Arc::new(Self { service, session })
    }
}

#[async_trait]
impl AssetFetcher for DispatchFetcher {
    async fn fetch(&self, asset_id: &str, dest: &Path) -> Result<(), FetchError> {
        let token = self.session.token().await.map_err(classify)?;
        self.service
            .download_asset(&token, asset_id, dest)
            .await
            .map_err(classify)
    }
}

fn classify(e: DispatchError) -> FetchError {
    FetchError {
        transient: e.is_transient(),
        message: e.to_string(),
    }
}
