//! Routing store: different asset kinds, different backends.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{Asset, AssetKind, AssetStore};
use crate::errors::RebuildResult;

/// Routes each asset kind to a backing store, with a fallback for unrouted
/// kinds. The contract is the same as a plain store; callers cannot observe
/// the routing.
#[derive(Clone, Default)]
pub struct MixedStore {
    routes: HashMap<AssetKind, Arc<dyn AssetStore>>,
    fallback: Option<Arc<dyn AssetStore>>,
}

impl MixedStore {
    /// An empty routing table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `kind` to `store`.
    pub fn route(mut self, kind: AssetKind, store: Arc<dyn AssetStore>) -> Self {
        self.routes.insert(kind, store);
        self
    }

    /// Store for every kind without an explicit route.
    pub fn fallback(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.fallback = Some(store);
        self
    }

    fn backing(&self, asset: &Asset) -> RebuildResult<&Arc<dyn AssetStore>> {
        self.routes
            .get(&asset.kind)
            .or(self.fallback.as_ref())
            .ok_or_else(|| {
                crate::errors::RebuildError::internal(format!(
                    "no store routed for asset kind {:?}",
                    asset.kind
                ))
            })
    }
}

#[async_trait]
impl AssetStore for MixedStore {
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>> {
        self.backing(asset)?.read(asset).await
    }

    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        self.backing(asset)?.write(asset, data).await
    }

    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        self.backing(asset)?.write_new(asset, data).await
    }

    async fn exists(&self, asset: &Asset) -> RebuildResult<bool> {
        self.backing(asset)?.exists(asset).await
    }

    fn url(&self, asset: &Asset) -> String {
        match self.backing(asset) {
            Ok(store) => store.url(asset),
            Err(_) => format!("unrouted://{}", super::asset_path(asset)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemStore;
    use rebuildr_schema::{Ecosystem, Target};

    #[tokio::test]
    async fn routes_by_kind() {
        let artifacts = Arc::new(MemStore::new());
        let debug = Arc::new(MemStore::new());
        let store = MixedStore::new()
            .route(AssetKind::RebuiltArtifact, artifacts.clone())
            .fallback(debug.clone());

        let target =
            Target::new(Ecosystem::Maven, "com.example:lib", "1.2.3", "lib-1.2.3.jar").unwrap();
        let artifact = Asset::new(AssetKind::RebuiltArtifact, target.clone());
        let dockerfile = Asset::new(AssetKind::Dockerfile, target);

        store.write(&artifact, b"jar").await.unwrap();
        store.write(&dockerfile, b"FROM maven:3").await.unwrap();

        assert!(artifacts.exists(&artifact).await.unwrap());
        assert!(!artifacts.exists(&dockerfile).await.unwrap());
        assert!(debug.exists(&dockerfile).await.unwrap());
        // the mixed store itself answers for both
        assert!(store.exists(&artifact).await.unwrap());
        assert!(store.exists(&dockerfile).await.unwrap());
    }
}
