//! Object-store-backed asset stores.
//!
//! The service adapts to an object store, it does not host one: [`Bucket`][]
//! is the minimal surface we need (get/put/put-if-absent/exists), with an
//! HTTP implementation for real deployments and an in-memory one for tests.
//! [`CachedStore`][] layers a local store in front of a remote one.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{asset_path, Asset, AssetStore};
use crate::errors::{RebuildError, RebuildResult};

/// The minimal object-store surface the asset fabric needs.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Fetch an object.
    async fn get(&self, key: &str) -> RebuildResult<Vec<u8>>;
    /// Store an object, replacing any existing one.
    async fn put(&self, key: &str, data: &[u8]) -> RebuildResult<()>;
    /// Store an object only if absent; `AlreadyExists` otherwise.
    async fn put_new(&self, key: &str, data: &[u8]) -> RebuildResult<()>;
    /// Whether the object exists.
    async fn exists(&self, key: &str) -> RebuildResult<bool>;
    /// A URI for the object.
    fn object_url(&self, key: &str) -> String;
}

/// In-memory bucket for tests and smoketests.
#[derive(Debug, Default)]
pub struct MemBucket {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemBucket {
    /// An empty bucket.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bucket for MemBucket {
    async fn get(&self, key: &str) -> RebuildResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("object {key}")))
    }

    async fn put(&self, key: &str, data: &[u8]) -> RebuildResult<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    async fn put_new(&self, key: &str, data: &[u8]) -> RebuildResult<()> {
        let mut objects = self.objects.lock().unwrap();
        if objects.contains_key(key) {
            return Err(RebuildError::already_exists(format!("object {key}")));
        }
        objects.insert(key.to_owned(), data.to_vec());
        Ok(())
    }

    async fn exists(&self, key: &str) -> RebuildResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    fn object_url(&self, key: &str) -> String {
        format!("mem-bucket://{key}")
    }
}

/// Bucket speaking plain HTTP GET/PUT/HEAD against a base URL.
///
/// `put_new` relies on `If-None-Match: *`, which every S3/GCS-compatible
/// frontend we care about honors with 412 on conflict.
#[derive(Debug, Clone)]
pub struct HttpBucket {
    client: reqwest::Client,
    base: url::Url,
}

impl HttpBucket {
    /// A bucket under `base` (must end with `/` to keep joins sane).
    pub fn new(client: reqwest::Client, base: url::Url) -> Self {
        HttpBucket { client, base }
    }

    fn key_url(&self, key: &str) -> RebuildResult<url::Url> {
        Ok(self.base.join(key)?)
    }
}

#[async_trait]
impl Bucket for HttpBucket {
    async fn get(&self, key: &str) -> RebuildResult<Vec<u8>> {
        let url = self.key_url(key)?;
        let resp = self.client.get(url.clone()).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(RebuildError::not_found(format!("object {url}")));
        }
        let resp = resp.error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> RebuildResult<()> {
        let url = self.key_url(key)?;
        self.client
            .put(url)
            .body(data.to_vec())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn put_new(&self, key: &str, data: &[u8]) -> RebuildResult<()> {
        let url = self.key_url(key)?;
        let resp = self
            .client
            .put(url.clone())
            .header(reqwest::header::IF_NONE_MATCH, "*")
            .body(data.to_vec())
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::PRECONDITION_FAILED {
            return Err(RebuildError::already_exists(format!("object {url}")));
        }
        resp.error_for_status()?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> RebuildResult<bool> {
        let url = self.key_url(key)?;
        let resp = self.client.head(url).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        resp.error_for_status()?;
        Ok(true)
    }

    fn object_url(&self, key: &str) -> String {
        self.base
            .join(key)
            .map(String::from)
            .unwrap_or_else(|_| format!("{}{key}", self.base))
    }
}

/// Asset store over a [`Bucket`][] with an optional prefix and per-run path
/// component.
#[derive(Clone)]
pub struct BucketStore {
    bucket: Arc<dyn Bucket>,
    prefix: String,
    run_id: Option<String>,
}

impl BucketStore {
    /// A store over `bucket` under `prefix` (may be empty).
    pub fn new(bucket: Arc<dyn Bucket>, prefix: impl Into<String>) -> Self {
        BucketStore {
            bucket,
            prefix: prefix.into(),
            run_id: None,
        }
    }

    /// Segregate intermediate artifacts of concurrent builds by run id.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    fn key(&self, asset: &Asset) -> String {
        let mut segments = Vec::with_capacity(3);
        if !self.prefix.is_empty() {
            segments.push(self.prefix.clone());
        }
        if let Some(run_id) = &self.run_id {
            segments.push(run_id.clone());
        }
        segments.push(asset_path(asset));
        segments.join("/")
    }
}

#[async_trait]
impl AssetStore for BucketStore {
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>> {
        self.bucket.get(&self.key(asset)).await
    }

    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        self.bucket.put(&self.key(asset), data).await
    }

    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        self.bucket.put_new(&self.key(asset), data).await
    }

    async fn exists(&self, asset: &Asset) -> RebuildResult<bool> {
        self.bucket.exists(&self.key(asset)).await
    }

    fn url(&self, asset: &Asset) -> String {
        self.bucket.object_url(&self.key(asset))
    }
}

/// A local layer fronting a remote store: reads check the local layer first,
/// writes tee to both.
#[derive(Clone)]
pub struct CachedStore {
    local: Arc<dyn AssetStore>,
    remote: Arc<dyn AssetStore>,
}

impl CachedStore {
    /// Front `remote` with `local`.
    pub fn new(local: Arc<dyn AssetStore>, remote: Arc<dyn AssetStore>) -> Self {
        CachedStore { local, remote }
    }
}

#[async_trait]
impl AssetStore for CachedStore {
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>> {
        match self.local.read(asset).await {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == crate::errors::ErrorKind::NotFound => {
                let data = self.remote.read(asset).await?;
                if let Err(err) = self.local.write(asset, &data).await {
                    tracing::warn!("failed to backfill cache layer: {err}");
                }
                Ok(data)
            }
            Err(err) => Err(err),
        }
    }

    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        self.local.write(asset, data).await?;
        self.remote.write(asset, data).await
    }

    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        // The remote is store truth; the local layer is only a cache, so the
        // conflict check must happen remotely.
        self.remote.write_new(asset, data).await?;
        if let Err(err) = self.local.write(asset, data).await {
            tracing::warn!("failed to tee write to cache layer: {err}");
        }
        Ok(())
    }

    async fn exists(&self, asset: &Asset) -> RebuildResult<bool> {
        if self.local.exists(asset).await? {
            return Ok(true);
        }
        self.remote.exists(asset).await
    }

    fn url(&self, asset: &Asset) -> String {
        self.remote.url(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{AssetKind, MemStore};
    use rebuildr_schema::{Ecosystem, Target};

    fn asset() -> Asset {
        Asset::new(
            AssetKind::RebuiltArtifact,
            Target::new(Ecosystem::Npm, "left-pad", "1.3.0", "left-pad-1.3.0.tgz").unwrap(),
        )
    }

    #[tokio::test]
    async fn bucket_store_prefixes_and_conflicts() {
        let bucket = Arc::new(MemBucket::new());
        let store = BucketStore::new(bucket.clone(), "rebuild-artifacts").with_run_id("r-9");
        store.write_new(&asset(), b"tgz").await.unwrap();
        assert!(bucket
            .exists("rebuild-artifacts/r-9/npm/left-pad/1.3.0/left-pad-1.3.0.tgz/left-pad-1.3.0.tgz")
            .await
            .unwrap());
        assert!(store.write_new(&asset(), b"tgz2").await.is_err());
    }

    #[tokio::test]
    async fn cached_store_backfills_local() {
        let local = Arc::new(MemStore::new());
        let remote = Arc::new(MemStore::new());
        remote.write(&asset(), b"bytes").await.unwrap();

        let cached = CachedStore::new(local.clone(), remote.clone());
        assert_eq!(cached.read(&asset()).await.unwrap(), b"bytes");
        // second read is served locally
        assert_eq!(local.read(&asset()).await.unwrap(), b"bytes");
    }

    #[tokio::test]
    async fn cached_store_write_new_checks_remote() {
        let local = Arc::new(MemStore::new());
        let remote = Arc::new(MemStore::new());
        remote.write(&asset(), b"published").await.unwrap();

        let cached = CachedStore::new(local, remote);
        let err = cached.write_new(&asset(), b"racer").await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::AlreadyExists);
    }
}
