//! Mock testing utils: canned registry, in-memory collaborators, and a fully
//! wired pipeline. Mostly you want [`test_pipeline`][]; the consts help you
//! assert the results.

use async_trait::async_trait;
use p256::ecdsa::SigningKey;
use rebuildr_schema::{Ecosystem, Target};
use std::collections::HashMap;
use std::io::Write as _;
use std::sync::{Arc, Mutex};

use crate::assets::{AssetStore, MemStore};
use crate::attempts::MemAttemptStore;
use crate::errors::{RebuildError, RebuildResult};
use crate::executor::{MemWorker, RemoteBuildExecutor};
use crate::gitsource::{MemCheckout, MemCloner};
use crate::infer::InferenceService;
use crate::pipeline::{BuildDefRepo, RebuildPipeline};
use crate::registry::{
    CrateVersionMeta, DebianSourceMeta, MavenArtifactMeta, NpmVersionMeta, PypiFile,
    PypiReleaseMeta, RegistryMux,
};
use crate::sign::{AttestationSigner, MemSigner};
use crate::verify::{PrebuildConfig, ServiceIdentity};

pub const SERVICE_REPO: &str = "https://github.com/rebuildr-dev/rebuildr";
pub const SERVICE_VERSION: &str = "v0.3.1";
pub const EXECUTOR_VERSION: &str = "v0.3.1-exec";

pub const PYPI_PKG: &str = "absl-py";
pub const PYPI_VER: &str = "2.0.0";
pub const PYPI_WHEEL: &str = "absl_py-2.0.0-py3-none-any.whl";
pub const PYPI_WHEEL_URL: &str =
    "https://files.pythonhosted.org/packages/absl_py-2.0.0-py3-none-any.whl";
pub const PYPI_REPO: &str = "https://github.com/abseil/abseil-py";
pub const PYPI_COMMIT: &str = "2f6b41ad29ba6f24c4ebbb4b7cde1a5a4c7ba179";

pub const NPM_PKG: &str = "left-pad";
pub const NPM_VER: &str = "1.3.0";
pub const NPM_TGZ: &str = "left-pad-1.3.0.tgz";
pub const NPM_TGZ_URL: &str = "https://registry.npmjs.org/left-pad/-/left-pad-1.3.0.tgz";
pub const NPM_REPO: &str = "https://github.com/stevemao/left-pad";
pub const NPM_COMMIT: &str = "9cbb52d40b2dea957b6b55d1b38ea3e211e69fe4";

pub const DEB_PKG: &str = "xz-utils";
pub const DEB_VER: &str = "5.4.1";
pub const DEB_EPOCH_VER: &str = "1:5.4.1";
pub const DEB_ARTIFACT: &str = "xz-utils_5.4.1_amd64.deb";
pub const DEB_URL: &str = "https://deb.debian.org/debian/pool/main/x/xz-utils/xz-utils_5.4.1_amd64.deb";

pub const BUILD_DEF_REPO: &str = "https://github.com/rebuildr-dev/build-definitions";
pub const BUILD_DEF_COMMIT: &str = "77aa0cc11223344556677889900aabbccddeeff0";

/// A wheel fixture; `noisy` shuffles entry order and stamps mtimes so the
/// bytes differ while the contents do not.
pub fn wheel_bytes(noisy: bool) -> Vec<u8> {
    let mut files: Vec<(&str, &[u8])> = vec![
        ("absl/__init__.py", b""),
        ("absl/app.py", b"import sys\n"),
        (
            "absl_py-2.0.0.dist-info/RECORD",
            b"absl/__init__.py,,\nabsl/app.py,,\n",
        ),
    ];
    if noisy {
        files.reverse();
    }
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    for (name, data) in files {
        let mut options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated);
        if noisy {
            options = options
                .last_modified_time(zip::DateTime::from_date_and_time(2023, 11, 1, 12, 30, 0).unwrap());
        }
        writer.start_file(name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A minimal npm tarball fixture.
pub fn npm_tgz_bytes() -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let manifest = br#"{"name":"left-pad","version":"1.3.0"}"#;
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    builder
        .append_data(&mut header, "package/package.json", &manifest[..])
        .unwrap();
    let tarball = builder.into_inner().unwrap();

    let mut encoder = flate2::GzBuilder::new()
        .write(Vec::new(), flate2::Compression::new(6));
    encoder.write_all(&tarball).unwrap();
    encoder.finish().unwrap()
}

/// Canned registry metadata.
#[derive(Default)]
pub struct MockRegistry {
    pub npm: Mutex<HashMap<(String, String), NpmVersionMeta>>,
    pub pypi: Mutex<HashMap<(String, String), PypiReleaseMeta>>,
    pub crates: Mutex<HashMap<(String, String), CrateVersionMeta>>,
    pub debian: Mutex<HashMap<(String, String), DebianSourceMeta>>,
    pub maven: Mutex<HashMap<(String, String), MavenArtifactMeta>>,
    pub versions: Mutex<HashMap<(Ecosystem, String), Vec<String>>>,
    pub artifact_urls: Mutex<HashMap<(Ecosystem, String, String), String>>,
    pub artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` for `url` and map the target coordinates to it.
    pub fn serve_artifact(
        &self,
        ecosystem: Ecosystem,
        package: &str,
        version: &str,
        url: &str,
        bytes: &[u8],
    ) {
        self.artifact_urls.lock().unwrap().insert(
            (ecosystem, package.to_owned(), version.to_owned()),
            url.to_owned(),
        );
        self.artifacts
            .lock()
            .unwrap()
            .insert(url.to_owned(), bytes.to_vec());
    }
}

fn lookup<T: Clone>(
    map: &Mutex<HashMap<(String, String), T>>,
    package: &str,
    version: &str,
    what: &str,
) -> RebuildResult<T> {
    map.lock()
        .unwrap()
        .get(&(package.to_owned(), version.to_owned()))
        .cloned()
        .ok_or_else(|| RebuildError::not_found(format!("{what} {package} {version}")))
}

#[async_trait]
impl RegistryMux for MockRegistry {
    async fn npm_version(&self, package: &str, version: &str) -> RebuildResult<NpmVersionMeta> {
        lookup(&self.npm, package, version, "npm version")
    }

    async fn pypi_release(&self, package: &str, version: &str) -> RebuildResult<PypiReleaseMeta> {
        lookup(&self.pypi, package, version, "pypi release")
    }

    async fn cratesio_version(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<CrateVersionMeta> {
        lookup(&self.crates, package, version, "crate version")
    }

    async fn debian_source(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<DebianSourceMeta> {
        lookup(&self.debian, package, version, "debian source")
    }

    async fn maven_artifact(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<MavenArtifactMeta> {
        lookup(&self.maven, package, version, "maven artifact")
    }

    async fn recent_versions(
        &self,
        ecosystem: Ecosystem,
        package: &str,
        limit: usize,
    ) -> RebuildResult<Vec<String>> {
        let versions = self
            .versions
            .lock()
            .unwrap()
            .get(&(ecosystem, package.to_owned()))
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("versions of {package}")))?;
        Ok(versions.into_iter().take(limit).collect())
    }

    async fn artifact_url(&self, target: &Target) -> RebuildResult<String> {
        self.artifact_urls
            .lock()
            .unwrap()
            .get(&(
                target.ecosystem,
                target.package.clone(),
                target.version.clone(),
            ))
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("artifact url for {target}")))
    }

    async fn fetch_artifact(&self, url: &str) -> RebuildResult<Vec<u8>> {
        self.artifacts
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RebuildError::not_found(format!("artifact {url}")))
    }
}

/// A fully wired in-memory pipeline plus handles on every collaborator.
pub struct TestPipeline {
    pub registry: Arc<MockRegistry>,
    pub worker: Arc<MemWorker>,
    pub remote_store: Arc<MemStore>,
    pub attestation_store: Arc<dyn AssetStore>,
    pub debug_store: Arc<MemStore>,
    pub attempts: Arc<MemAttemptStore>,
    pub signer: Arc<dyn AttestationSigner>,
    pub pipeline: Arc<RebuildPipeline>,
}

/// A fresh signer with a random key.
pub fn test_signer() -> Arc<dyn AttestationSigner> {
    Arc::new(MemSigner::new(
        SigningKey::random(&mut rand::rngs::OsRng),
        "kms://projects/test/locations/global/keyRings/rebuilds/cryptoKeys/signing/cryptoKeyVersions/1",
    ))
}

/// Wire a pipeline around canned collaborators. Pass the same signer and
/// attestation store across calls to model multiple service instances
/// against one bundle store.
pub fn test_pipeline(
    service_version: &str,
    signer: Arc<dyn AttestationSigner>,
    attestation_store: Arc<dyn AssetStore>,
    repos: HashMap<String, MemCheckout>,
) -> TestPipeline {
    let registry = Arc::new(MockRegistry::new());
    let remote_store = Arc::new(MemStore::new());
    let debug_store = Arc::new(MemStore::new());
    let attempts = Arc::new(MemAttemptStore::new());
    let worker = Arc::new(MemWorker::new(remote_store.clone()));
    let cloner = Arc::new(MemCloner { repos });
    let inference = Arc::new(InferenceService::new(
        registry.clone(),
        cloner.clone(),
        service_version,
    ));
    let executor = Arc::new(RemoteBuildExecutor::new(
        worker.clone(),
        remote_store.clone(),
        EXECUTOR_VERSION,
    ));

    let pipeline = Arc::new(RebuildPipeline {
        registry: registry.clone(),
        inference,
        executor,
        remote_store: remote_store.clone(),
        attestation_store: attestation_store.clone(),
        debug_store: debug_store.clone(),
        signer: signer.clone(),
        attempts: attempts.clone(),
        cloner,
        service: ServiceIdentity {
            repo: SERVICE_REPO.to_owned(),
            version: service_version.to_owned(),
        },
        prebuild: PrebuildConfig {
            bucket_url: "https://prebuild.rebuildr.dev/tools".to_owned(),
            auth: false,
        },
        build_def_repo: Some(BuildDefRepo {
            repo: BUILD_DEF_REPO.to_owned(),
            git_ref: "main".to_owned(),
        }),
        build_options: Default::default(),
    });

    TestPipeline {
        registry,
        worker,
        remote_store,
        attestation_store,
        debug_store,
        attempts,
        signer,
        pipeline,
    }
}

/// The default pypi fixture: registry metadata, upstream wheel, and a source
/// repo inference can pin.
pub fn pypi_fixture(upstream: &[u8]) -> TestPipeline {
    pypi_fixture_with(
        upstream,
        SERVICE_VERSION,
        test_signer(),
        Arc::new(MemStore::new()),
    )
}

/// [`pypi_fixture`][] with an explicit service version, signer, and bundle
/// store, for modeling several service instances against one ledger.
pub fn pypi_fixture_with(
    upstream: &[u8],
    service_version: &str,
    signer: Arc<dyn AttestationSigner>,
    attestation_store: Arc<dyn AssetStore>,
) -> TestPipeline {
    let mut repos = HashMap::new();
    repos.insert(
        PYPI_REPO.to_owned(),
        MemCheckout {
            head: PYPI_COMMIT.to_owned(),
            files: HashMap::from([(
                "pyproject.toml".to_owned(),
                b"[build-system]\nrequires = [\"setuptools>=68\"]\n".to_vec(),
            )]),
            refs: HashMap::from([(format!("v{PYPI_VER}"), PYPI_COMMIT.to_owned())]),
        },
    );
    let fixture = test_pipeline(service_version, signer, attestation_store, repos);
    fixture.registry.pypi.lock().unwrap().insert(
        (PYPI_PKG.to_owned(), PYPI_VER.to_owned()),
        PypiReleaseMeta {
            repository: Some(PYPI_REPO.to_owned()),
            files: vec![PypiFile {
                filename: PYPI_WHEEL.to_owned(),
                url: PYPI_WHEEL_URL.to_owned(),
                kind: "bdist_wheel".to_owned(),
                uploaded_at: Some("2023-11-01T12:30:00Z".parse().unwrap()),
            }],
        },
    );
    fixture
        .registry
        .serve_artifact(Ecosystem::Pypi, PYPI_PKG, PYPI_VER, PYPI_WHEEL_URL, upstream);
    fixture
}

/// The pypi target every fixture rebuilds.
pub fn pypi_target() -> Target {
    Target::new(Ecosystem::Pypi, PYPI_PKG, PYPI_VER, PYPI_WHEEL).unwrap()
}
