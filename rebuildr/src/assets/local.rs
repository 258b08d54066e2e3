//! Scratch filesystem store for per-run artifacts.

use async_trait::async_trait;
use camino::Utf8PathBuf;

use super::{asset_path, Asset, AssetStore};
use crate::errors::{RebuildError, RebuildResult};

/// Asset store rooted at a local directory.
///
/// An optional run id is injected as a path component so concurrent runs
/// sharing one debug-storage root cannot clobber each other's intermediates.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: Utf8PathBuf,
    run_id: Option<String>,
}

impl FsStore {
    /// A store rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        FsStore {
            root: root.into(),
            run_id: None,
        }
    }

    /// Segregate this store's contents under a per-run path component.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    fn full_path(&self, asset: &Asset) -> Utf8PathBuf {
        let mut path = self.root.clone();
        if let Some(run_id) = &self.run_id {
            path.push(run_id);
        }
        path.push(asset_path(asset));
        path
    }
}

#[async_trait]
impl AssetStore for FsStore {
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>> {
        let path = self.full_path(asset);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(RebuildError::not_found(format!("asset {path}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        let path = self.full_path(asset);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        let path = self.full_path(asset);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // create_new gives us the atomic create-if-not-exists the arbitration
        // contract requires; checking exists() first would race.
        let result = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match result {
            Ok(file) => {
                let mut file = file;
                use tokio::io::AsyncWriteExt;
                file.write_all(data).await?;
                file.flush().await?;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RebuildError::already_exists(format!("asset {path}")))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, asset: &Asset) -> RebuildResult<bool> {
        Ok(tokio::fs::try_exists(self.full_path(asset)).await?)
    }

    fn url(&self, asset: &Asset) -> String {
        format!("file://{}", self.full_path(asset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetKind;
    use rebuildr_schema::{Ecosystem, Target};
    use temp_dir::TempDir;

    #[tokio::test]
    async fn fs_store_roundtrip_and_conflict() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path().to_str().unwrap()).with_run_id("run-1");
        let target =
            Target::new(Ecosystem::Cratesio, "serde", "1.0.200", "serde-1.0.200.crate").unwrap();
        let asset = Asset::new(AssetKind::Dockerfile, target);

        assert!(!store.exists(&asset).await.unwrap());
        store.write_new(&asset, b"FROM debian:12").await.unwrap();
        assert_eq!(store.read(&asset).await.unwrap(), b"FROM debian:12");

        let err = store.write_new(&asset, b"FROM alpine").await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::AlreadyExists);

        // plain write still replaces
        store.write(&asset, b"FROM alpine").await.unwrap();
        assert_eq!(store.read(&asset).await.unwrap(), b"FROM alpine");
        assert!(store.url(&asset).contains("/run-1/cratesio/serde/"));
    }
}
