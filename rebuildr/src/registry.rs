//! Registry metadata access.
//!
//! The per-ecosystem registry clients are collaborators, not core: the
//! pipeline and the inference service consume them through [`RegistryMux`][],
//! and tests substitute a canned implementation. The HTTP implementation
//! carries the coalescing metadata cache: one inflight request per URL,
//! followers attach to the same future's result.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rebuildr_schema::{Ecosystem, Target};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::{RebuildError, RebuildResult};

/// npm version metadata the pipeline cares about.
#[derive(Debug, Clone, Default)]
pub struct NpmVersionMeta {
    /// Repository URL from the manifest, if declared
    pub repository: Option<String>,
    /// Published tarball URL
    pub tarball_url: String,
    /// npm version that produced the publish
    pub npm_version: Option<String>,
    /// Publish timestamp
    pub published_at: Option<DateTime<Utc>>,
}

/// One file of a PyPI release.
#[derive(Debug, Clone)]
pub struct PypiFile {
    /// Published filename
    pub filename: String,
    /// Download URL
    pub url: String,
    /// `bdist_wheel`, `sdist`, ...
    pub kind: String,
    /// Upload timestamp
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl PypiFile {
    /// Whether this is a pure (any-platform) wheel.
    pub fn is_pure_wheel(&self) -> bool {
        self.kind == "bdist_wheel" && self.filename.ends_with("-none-any.whl")
    }
}

/// PyPI release metadata.
#[derive(Debug, Clone, Default)]
pub struct PypiReleaseMeta {
    /// Repository URL from the project metadata, if declared
    pub repository: Option<String>,
    /// Files of this release
    pub files: Vec<PypiFile>,
}

impl PypiReleaseMeta {
    /// The first pure wheel of the release; this is the artifact smoketests
    /// pick when the request names none.
    pub fn pick_pure_wheel(&self) -> RebuildResult<&PypiFile> {
        self.files
            .iter()
            .find(|f| f.is_pure_wheel())
            .ok_or_else(|| RebuildError::not_found("selecting artifact: no pure wheel published"))
    }
}

/// crates.io version metadata.
#[derive(Debug, Clone, Default)]
pub struct CrateVersionMeta {
    /// Repository URL from the crate metadata
    pub repository: Option<String>,
    /// Declared minimum rust version, if any
    pub rust_version: Option<String>,
    /// Publish timestamp
    pub published_at: Option<DateTime<Utc>>,
}

/// A source file plus its registry-published checksum.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Download URL
    pub url: String,
    /// Hex digest the registry published
    pub checksum: String,
}

/// Debian source package metadata.
#[derive(Debug, Clone)]
pub struct DebianSourceMeta {
    /// Archive component (main, contrib, non-free)
    pub component: String,
    /// The .dsc control file
    pub dsc: SourceFile,
    /// The upstream tarball (absent for native packages)
    pub orig: Option<SourceFile>,
    /// The packaging tarball
    pub debian: Option<SourceFile>,
    /// Whether the package is native
    pub native: bool,
}

/// Maven artifact metadata.
#[derive(Debug, Clone, Default)]
pub struct MavenArtifactMeta {
    /// SCM URL from the pom, if declared
    pub scm_url: Option<String>,
    /// Jar download URL
    pub jar_url: String,
}

/// The multiplexed registry fetcher the core consumes.
#[async_trait]
pub trait RegistryMux: Send + Sync {
    /// npm metadata for one published version.
    async fn npm_version(&self, package: &str, version: &str) -> RebuildResult<NpmVersionMeta>;
    /// PyPI metadata for one release.
    async fn pypi_release(&self, package: &str, version: &str) -> RebuildResult<PypiReleaseMeta>;
    /// crates.io metadata for one version.
    async fn cratesio_version(&self, package: &str, version: &str)
        -> RebuildResult<CrateVersionMeta>;
    /// Debian source metadata for one version (may be epoch-qualified).
    async fn debian_source(&self, package: &str, version: &str)
        -> RebuildResult<DebianSourceMeta>;
    /// Maven metadata for one `group:artifact` version.
    async fn maven_artifact(&self, package: &str, version: &str)
        -> RebuildResult<MavenArtifactMeta>;
    /// The most recently published versions, newest first.
    async fn recent_versions(
        &self,
        ecosystem: Ecosystem,
        package: &str,
        limit: usize,
    ) -> RebuildResult<Vec<String>>;
    /// The canonical upstream download URL for a target's artifact.
    async fn artifact_url(&self, target: &Target) -> RebuildResult<String>;
    /// Fetch raw artifact bytes.
    async fn fetch_artifact(&self, url: &str) -> RebuildResult<Vec<u8>>;
}

/// Coalescing in-memory cache keyed by URL: one inflight request per key,
/// followers await the same cell.
#[derive(Default)]
pub struct MetadataCache {
    cells: Mutex<HashMap<String, Arc<tokio::sync::OnceCell<Arc<Vec<u8>>>>>>,
}

impl MetadataCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached bytes for `url`, fetching at most once concurrently.
    pub async fn get_or_fetch<F, Fut>(&self, url: &str, fetch: F) -> RebuildResult<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RebuildResult<Vec<u8>>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            cells
                .entry(url.to_owned())
                .or_insert_with(|| Arc::new(tokio::sync::OnceCell::new()))
                .clone()
        };
        cell.get_or_try_init(|| async { fetch().await.map(Arc::new) })
            .await
            .cloned()
    }
}

/// [`RegistryMux`][] over the public registry HTTP endpoints.
pub struct HttpRegistry {
    client: reqwest::Client,
    cache: MetadataCache,
}

impl HttpRegistry {
    /// A registry client over the shared HTTP client.
    pub fn new(client: reqwest::Client) -> Self {
        HttpRegistry {
            client,
            cache: MetadataCache::new(),
        }
    }

    async fn get_json(&self, url: &str) -> RebuildResult<serde_json::Value> {
        let client = self.client.clone();
        let url_owned = url.to_owned();
        let bytes = self
            .cache
            .get_or_fetch(url, || async move { fetch_checked(&client, &url_owned).await })
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// GET with the canonical upstream status mapping; Retry-After round-trips.
async fn fetch_checked(client: &reqwest::Client, url: &str) -> RebuildResult<Vec<u8>> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    let retry_after = resp
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs);
    match status.as_u16() {
        404 => Err(RebuildError::not_found(format!("upstream {url}"))),
        429 => Err(RebuildError::ResourceExhausted {
            message: format!("upstream {url}"),
            retry_after,
        }),
        503 => Err(RebuildError::Unavailable {
            message: format!("upstream {url}"),
            retry_after,
        }),
        _ => Ok(resp.error_for_status()?.bytes().await?.to_vec()),
    }
}

#[derive(Deserialize)]
struct NpmDist {
    tarball: String,
}

fn repo_url_from_value(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("url")
            .and_then(|u| u.as_str())
            .map(|s| s.to_owned()),
        _ => None,
    }
}

#[async_trait]
impl RegistryMux for HttpRegistry {
    async fn npm_version(&self, package: &str, version: &str) -> RebuildResult<NpmVersionMeta> {
        let packument = self
            .get_json(&format!("https://registry.npmjs.org/{package}"))
            .await?;
        let version_meta = packument["versions"].get(version).ok_or_else(|| {
            RebuildError::not_found(format!("npm version {package}@{version}"))
        })?;
        let dist: NpmDist = serde_json::from_value(version_meta["dist"].clone())?;
        let published_at = packument["time"]
            .get(version)
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse().ok());
        Ok(NpmVersionMeta {
            repository: version_meta
                .get("repository")
                .and_then(repo_url_from_value)
                .or_else(|| packument.get("repository").and_then(repo_url_from_value)),
            tarball_url: dist.tarball,
            npm_version: version_meta
                .get("_npmVersion")
                .and_then(|v| v.as_str())
                .map(|s| s.to_owned()),
            published_at,
        })
    }

    async fn pypi_release(&self, package: &str, version: &str) -> RebuildResult<PypiReleaseMeta> {
        let release = self
            .get_json(&format!("https://pypi.org/pypi/{package}/{version}/json"))
            .await?;
        let files = release["urls"]
            .as_array()
            .map(|urls| {
                urls.iter()
                    .filter_map(|file| {
                        Some(PypiFile {
                            filename: file["filename"].as_str()?.to_owned(),
                            url: file["url"].as_str()?.to_owned(),
                            kind: file["packagetype"].as_str().unwrap_or("").to_owned(),
                            uploaded_at: file["upload_time_iso_8601"]
                                .as_str()
                                .and_then(|t| t.parse().ok()),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let info = &release["info"];
        let repository = info["project_urls"]
            .as_object()
            .and_then(|urls| {
                ["Source", "Source Code", "Repository", "Homepage", "Code"]
                    .iter()
                    .find_map(|key| urls.get(*key))
            })
            .and_then(|u| u.as_str())
            .map(|s| s.to_owned());
        Ok(PypiReleaseMeta { repository, files })
    }

    async fn cratesio_version(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<CrateVersionMeta> {
        let krate = self
            .get_json(&format!("https://crates.io/api/v1/crates/{package}"))
            .await?;
        let version_meta = self
            .get_json(&format!(
                "https://crates.io/api/v1/crates/{package}/{version}"
            ))
            .await?;
        Ok(CrateVersionMeta {
            repository: krate["crate"]["repository"].as_str().map(|s| s.to_owned()),
            rust_version: version_meta["version"]["rust_version"]
                .as_str()
                .map(|s| s.to_owned()),
            published_at: version_meta["version"]["created_at"]
                .as_str()
                .and_then(|t| t.parse().ok()),
        })
    }

    async fn debian_source(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<DebianSourceMeta> {
        // sources.debian.org indexes by the epoch-qualified version; pool
        // filenames strip the epoch.
        let meta = self
            .get_json(&format!(
                "https://sources.debian.org/api/src/{package}/{version}/"
            ))
            .await?;
        if meta.get("error").is_some() {
            return Err(RebuildError::not_found(format!(
                "debian source {package} {version}"
            )));
        }
        let component = meta["pkg_infos"]["area"].as_str().unwrap_or("main").to_owned();
        let pool_version = version.split_once(':').map(|(_, v)| v).unwrap_or(version);
        let prefix = pool_prefix(package);
        let base = format!("https://deb.debian.org/debian/pool/{component}/{prefix}/{package}");
        let (upstream_version, native) = match pool_version.rsplit_once('-') {
            Some((upstream, _revision)) => (upstream.to_owned(), false),
            None => (pool_version.to_owned(), true),
        };
        let orig = (!native).then(|| SourceFile {
            url: format!("{base}/{package}_{upstream_version}.orig.tar.xz"),
            checksum: String::new(),
        });
        let debian = (!native).then(|| SourceFile {
            url: format!("{base}/{package}_{pool_version}.debian.tar.xz"),
            checksum: String::new(),
        });
        Ok(DebianSourceMeta {
            component,
            dsc: SourceFile {
                url: format!("{base}/{package}_{pool_version}.dsc"),
                checksum: String::new(),
            },
            orig,
            debian,
            native,
        })
    }

    async fn maven_artifact(
        &self,
        package: &str,
        version: &str,
    ) -> RebuildResult<MavenArtifactMeta> {
        let (group, artifact) = package.split_once(':').ok_or_else(|| {
            RebuildError::invalid_argument(format!("maven package must be group:artifact: {package}"))
        })?;
        let group_path = group.replace('.', "/");
        let base = format!("https://repo1.maven.org/maven2/{group_path}/{artifact}/{version}");
        let pom = self
            .get_json(&format!(
                "https://search.maven.org/solrsearch/select?q=g:{group}+AND+a:{artifact}+AND+v:{version}&wt=json"
            ))
            .await
            .ok();
        let scm_url = pom.as_ref().and_then(|p| {
            p["response"]["docs"]
                .get(0)
                .and_then(|d| d["scm"].as_str())
                .map(|s| s.to_owned())
        });
        Ok(MavenArtifactMeta {
            scm_url,
            jar_url: format!("{base}/{artifact}-{version}.jar"),
        })
    }

    async fn recent_versions(
        &self,
        ecosystem: Ecosystem,
        package: &str,
        limit: usize,
    ) -> RebuildResult<Vec<String>> {
        match ecosystem {
            Ecosystem::Npm => {
                let packument = self
                    .get_json(&format!("https://registry.npmjs.org/{package}"))
                    .await?;
                let versions: Vec<(String, String)> = packument["time"]
                    .as_object()
                    .map(|time| {
                        time.iter()
                            .filter(|(k, _)| *k != "created" && *k != "modified")
                            .filter_map(|(k, v)| Some((v.as_str()?.to_owned(), k.clone())))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(versions
                    .into_iter()
                    .sorted_by(|a, b| b.0.cmp(&a.0))
                    .map(|(_, v)| v)
                    .take(limit)
                    .collect())
            }
            Ecosystem::Cratesio => {
                let versions = self
                    .get_json(&format!("https://crates.io/api/v1/crates/{package}/versions"))
                    .await?;
                Ok(versions["versions"]
                    .as_array()
                    .map(|list| {
                        list.iter()
                            .filter_map(|v| v["num"].as_str().map(|s| s.to_owned()))
                            .take(limit)
                            .collect()
                    })
                    .unwrap_or_default())
            }
            Ecosystem::Pypi => {
                let project = self
                    .get_json(&format!("https://pypi.org/pypi/{package}/json"))
                    .await?;
                let versions: Vec<(String, String)> = project["releases"]
                    .as_object()
                    .map(|releases| {
                        releases
                            .iter()
                            .filter_map(|(version, files)| {
                                let uploaded = files
                                    .as_array()?
                                    .first()?
                                    .get("upload_time_iso_8601")?
                                    .as_str()?
                                    .to_owned();
                                Some((uploaded, version.clone()))
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(versions
                    .into_iter()
                    .sorted_by(|a, b| b.0.cmp(&a.0))
                    .map(|(_, v)| v)
                    .take(limit)
                    .collect())
            }
            other => Err(RebuildError::unimplemented(format!(
                "recent versions for {other}"
            ))),
        }
    }

    async fn artifact_url(&self, target: &Target) -> RebuildResult<String> {
        match target.ecosystem {
            Ecosystem::Npm => Ok(self
                .npm_version(&target.package, &target.version)
                .await?
                .tarball_url),
            Ecosystem::Pypi => {
                let release = self.pypi_release(&target.package, &target.version).await?;
                release
                    .files
                    .iter()
                    .find(|f| f.filename == target.artifact)
                    .map(|f| f.url.clone())
                    .ok_or_else(|| {
                        RebuildError::not_found(format!(
                            "selecting artifact: {} not in release",
                            target.artifact
                        ))
                    })
            }
            Ecosystem::Cratesio => Ok(format!(
                "https://static.crates.io/crates/{}/{}-{}.crate",
                target.package, target.package, target.version
            )),
            Ecosystem::Debian => {
                let source = self
                    .debian_source(&target.package, &target.version)
                    .await?;
                let prefix = pool_prefix(&target.package);
                Ok(format!(
                    "https://deb.debian.org/debian/pool/{}/{}/{}/{}",
                    source.component, prefix, target.package, target.artifact
                ))
            }
            Ecosystem::Maven => Ok(self
                .maven_artifact(&target.package, &target.version)
                .await?
                .jar_url),
        }
    }

    async fn fetch_artifact(&self, url: &str) -> RebuildResult<Vec<u8>> {
        fetch_checked(&self.client, url).await
    }
}

// Debian pool layout shards by the first letter, with the lib* packages
// sharded as "libX".
fn pool_prefix(package: &str) -> String {
    if let Some(rest) = package.strip_prefix("lib") {
        if let Some(first) = rest.chars().next() {
            return format!("lib{first}");
        }
    }
    package.chars().take(1).collect()
}
