//! The asset store fabric.
//!
//! Everything a rebuild produces or consumes is a named blob addressed by
//! `(asset kind, target)`. The path derivation in [`asset_path`][] is the sole
//! coupling between the remote build executor (which writes the rebuilt
//! artifact) and the verifier (which independently derives the same path), so
//! it is part of the public wire format: changes require a new asset kind,
//! never a silent path change.

use async_trait::async_trait;
use rebuildr_schema::Target;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::errors::{RebuildError, RebuildResult};

mod local;
mod mixed;
mod object;

pub use local::FsStore;
pub use mixed::MixedStore;
pub use object::{Bucket, BucketStore, CachedStore, HttpBucket, MemBucket};

/// Filename of the attestation bundle asset; also the reserved last path
/// segment checked by the enqueue endpoint.
pub const ATTESTATION_BUNDLE_FILE: &str = "rebuild.intoto.jsonl";

/// What a stored blob is. A closed set: every member has a fixed filename
/// under the target's path prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssetKind {
    /// The artifact produced by the remote build
    RebuiltArtifact,
    /// The Dockerfile the build ran in
    Dockerfile,
    /// The ordered worker steps of the compiled build plan
    BuildSteps,
    /// Build metadata JSON emitted by the worker
    BuildInfo,
    /// The signed attestation bundle
    AttestationBundle,
    /// Syscall monitor log captured during the build
    TetragonLog,
    /// Network egress log captured during the build
    NetworkLog,
    /// The strategy the inference service settled on
    InferredStrategy,
    /// Inference service debug log
    InferenceLog,
}

impl AssetKind {
    /// The filename this kind stores under the target prefix.
    pub fn file_name(&self, target: &Target) -> String {
        match self {
            AssetKind::RebuiltArtifact => target.artifact.clone(),
            AssetKind::Dockerfile => "Dockerfile".to_owned(),
            AssetKind::BuildSteps => "steps.json".to_owned(),
            AssetKind::BuildInfo => "info.json".to_owned(),
            AssetKind::AttestationBundle => ATTESTATION_BUNDLE_FILE.to_owned(),
            AssetKind::TetragonLog => "tetragon.jsonl".to_owned(),
            AssetKind::NetworkLog => "netlog.json".to_owned(),
            AssetKind::InferredStrategy => "strategy.yaml".to_owned(),
            AssetKind::InferenceLog => "inference.log".to_owned(),
        }
    }
}

/// One addressable blob: a kind plus the target it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Asset {
    /// What the blob is
    pub kind: AssetKind,
    /// Whose blob it is
    pub target: Target,
}

impl Asset {
    /// Address the given kind of asset for a target.
    pub fn new(kind: AssetKind, target: Target) -> Self {
        Asset { kind, target }
    }
}

/// The path derivation rule: a pure function of `(kind, target)`.
///
/// `<ecosystem>/<package>/<version>/<artifact>/<asset-file>` with the npm
/// slash encoding applied to the package segment.
pub fn asset_path(asset: &Asset) -> String {
    let t = &asset.target;
    format!(
        "{}/{}/{}/{}/{}",
        t.ecosystem,
        t.encoded_package(),
        t.version,
        t.artifact,
        asset.kind.file_name(t)
    )
}

/// Uniform read/write of named blobs across backends.
///
/// `write_new` is the arbitration primitive: create-if-not-exists semantics
/// are what serialize concurrent publishers of the same bundle. Callers must
/// not re-implement that race with application-level locks.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Read the whole blob.
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>>;

    /// Write the blob, replacing any existing content.
    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()>;

    /// Write the blob only if absent; `AlreadyExists` otherwise.
    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()>;

    /// Whether the blob exists.
    async fn exists(&self, asset: &Asset) -> RebuildResult<bool>;

    /// A URI a human or a worker can use to locate the blob.
    fn url(&self, asset: &Asset) -> String;
}

/// In-memory store; the scratch space of choice in tests and smoketests.
#[derive(Debug, Default)]
pub struct MemStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AssetStore for MemStore {
    async fn read(&self, asset: &Asset) -> RebuildResult<Vec<u8>> {
        let path = asset_path(asset);
        let blobs = self.blobs.lock().unwrap();
        blobs
            .get(&path)
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("asset {path}")))
    }

    async fn write(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        let path = asset_path(asset);
        self.blobs.lock().unwrap().insert(path, data.to_vec());
        Ok(())
    }

    async fn write_new(&self, asset: &Asset, data: &[u8]) -> RebuildResult<()> {
        let path = asset_path(asset);
        let mut blobs = self.blobs.lock().unwrap();
        if blobs.contains_key(&path) {
            return Err(RebuildError::already_exists(format!("asset {path}")));
        }
        blobs.insert(path, data.to_vec());
        Ok(())
    }

    async fn exists(&self, asset: &Asset) -> RebuildResult<bool> {
        Ok(self.blobs.lock().unwrap().contains_key(&asset_path(asset)))
    }

    fn url(&self, asset: &Asset) -> String {
        format!("mem://{}", asset_path(asset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuildr_schema::Ecosystem;

    fn wheel_target() -> Target {
        Target::new(
            Ecosystem::Pypi,
            "absl-py",
            "2.0.0",
            "absl_py-2.0.0-py3-none-any.whl",
        )
        .unwrap()
    }

    #[test]
    fn path_is_pure_and_encoded() {
        let scoped = Target::new(Ecosystem::Npm, "@types/node", "20.1.0", "node-20.1.0.tgz")
            .unwrap();
        let asset = Asset::new(AssetKind::AttestationBundle, scoped);
        let first = asset_path(&asset);
        assert_eq!(
            first,
            "npm/@types!node/20.1.0/node-20.1.0.tgz/rebuild.intoto.jsonl"
        );
        assert_eq!(asset_path(&asset), first);
    }

    #[tokio::test]
    async fn mem_store_write_new_conflicts() {
        let store = MemStore::new();
        let asset = Asset::new(AssetKind::AttestationBundle, wheel_target());
        store.write_new(&asset, b"one").await.unwrap();
        let err = store.write_new(&asset, b"two").await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::AlreadyExists);
        assert_eq!(store.read(&asset).await.unwrap(), b"one");
        assert!(store.exists(&asset).await.unwrap());
    }
}
