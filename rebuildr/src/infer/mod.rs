//! Strategy inference.
//!
//! Consumes a target and optionally a location hint, clones the upstream
//! source into caller-owned storage, and runs the ecosystem heuristic to emit
//! a typed build recipe whose location pins `ref` to a commit. The service is
//! stateless; everything it touches arrives as an argument.

use rebuildr_schema::strategy::{Strategy, StrategyOneOf};
use rebuildr_schema::{Ecosystem, Location, Target};
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::assets::{Asset, AssetKind, AssetStore};
use crate::errors::{RebuildError, RebuildResult};
use crate::gitsource::{RepoCheckout, RepoCloner};
use crate::registry::RegistryMux;

mod cratesio;
mod debian;
mod maven;
mod npm;
mod pypi;

/// Forges whose URLs we normalize aggressively.
const KNOWN_FORGES: &[&str] = &["github.com", "gitlab.com", "bitbucket.org", "codeberg.org"];

/// Canonicalize a repository URL: https scheme on known forges, lowercased
/// host, no trailing `.git` or slash.
pub fn canonicalize_repo_url(raw: &str) -> RebuildResult<String> {
    // registry metadata often carries "git+https://..." specs
    let raw = raw.trim().trim_start_matches("git+");
    let mut url = Url::parse(raw)?;
    let host = url
        .host_str()
        .ok_or_else(|| RebuildError::invalid_argument(format!("repo url has no host: {raw}")))?
        .to_ascii_lowercase();
    if KNOWN_FORGES.contains(&host.as_str()) {
        let _ = url.set_scheme("https");
    }
    url.set_host(Some(&host))?;
    let mut canonical = url.to_string();
    while canonical.ends_with('/') {
        canonical.pop();
    }
    if let Some(stripped) = canonical.strip_suffix(".git") {
        canonical = stripped.to_owned();
    }
    Ok(canonical)
}

/// Ref candidates a release is usually tagged as, most specific first.
pub(crate) fn tag_candidates(target: &Target) -> Vec<String> {
    let bare_package = target
        .package
        .rsplit('/')
        .next()
        .unwrap_or(&target.package)
        .to_owned();
    vec![
        format!("v{}", target.version),
        target.version.clone(),
        format!("{}@{}", target.package, target.version),
        format!("{}-{}", bare_package, target.version),
        format!("{}_{}", bare_package, target.version),
    ]
}

/// Pin a location's ref to a commit: hint ref wins, then release tags, then
/// the checkout head.
pub(crate) fn pin_ref(
    target: &Target,
    checkout: &dyn RepoCheckout,
    hint_ref: Option<&str>,
) -> String {
    if let Some(hint_ref) = hint_ref {
        if !hint_ref.is_empty() {
            return hint_ref.to_owned();
        }
    }
    checkout
        .resolve_ref(&tag_candidates(target))
        .unwrap_or_else(|| checkout.head_commit().to_owned())
}

/// The strategy-inference service.
pub struct InferenceService {
    registry: Arc<dyn RegistryMux>,
    cloner: Arc<dyn RepoCloner>,
    log_store: Option<Arc<dyn AssetStore>>,
    version: String,
}

impl InferenceService {
    /// Assemble the service from its collaborators.
    pub fn new(
        registry: Arc<dyn RegistryMux>,
        cloner: Arc<dyn RepoCloner>,
        version: impl Into<String>,
    ) -> Self {
        InferenceService {
            registry,
            cloner,
            log_store: None,
            version: version.into(),
        }
    }

    /// Tee inferred strategies to an asset store for debugging.
    pub fn with_log_store(mut self, store: Arc<dyn AssetStore>) -> Self {
        self.log_store = Some(store);
        self
    }

    /// The service's reported version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Infer a strategy for `target`, honoring an optional hint.
    pub async fn infer(
        &self,
        target: &Target,
        hint: Option<&StrategyOneOf>,
    ) -> RebuildResult<StrategyOneOf> {
        target.validate()?;

        let hint_location = match hint {
            Some(oneof) => match oneof.strategy()? {
                // a full strategy needs no inference; pass it through
                strategy @ (Strategy::NpmPackBuild(_)
                | Strategy::PypiWheelBuild(_)
                | Strategy::CratesioCargoPackage(_)
                | Strategy::DebianPackage(_)
                | Strategy::MavenBuild(_)
                | Strategy::Manual(_)
                | Strategy::Workflow(_)) => return Ok(StrategyOneOf::from(strategy)),
                Strategy::LocationHint(location) => {
                    validate_hint(&location)?;
                    Some(location)
                }
            },
            None => None,
        };

        let strategy = match target.ecosystem {
            Ecosystem::Npm => {
                npm::infer(
                    target,
                    hint_location.as_ref(),
                    self.registry.as_ref(),
                    self.cloner.as_ref(),
                )
                .await?
            }
            Ecosystem::Pypi => {
                pypi::infer(
                    target,
                    hint_location.as_ref(),
                    self.registry.as_ref(),
                    self.cloner.as_ref(),
                )
                .await?
            }
            Ecosystem::Cratesio => {
                cratesio::infer(
                    target,
                    hint_location.as_ref(),
                    self.registry.as_ref(),
                    self.cloner.as_ref(),
                )
                .await?
            }
            Ecosystem::Debian => debian::infer(target, self.registry.as_ref()).await?,
            Ecosystem::Maven => {
                maven::infer(
                    target,
                    hint_location.as_ref(),
                    self.registry.as_ref(),
                    self.cloner.as_ref(),
                )
                .await?
            }
        };
        info!(%target, kind = strategy.kind(), "inferred strategy");

        let oneof = StrategyOneOf::from(strategy);
        if let Some(store) = &self.log_store {
            let asset = Asset::new(AssetKind::InferredStrategy, target.clone());
            match serde_yml::to_string(&oneof) {
                Ok(yaml) => {
                    if let Err(err) = store.write(&asset, yaml.as_bytes()).await {
                        tracing::warn!("failed to tee inferred strategy: {err}");
                    }
                }
                Err(err) => tracing::warn!("failed to serialize inferred strategy: {err}"),
            }
        }
        Ok(oneof)
    }
}

fn validate_hint(location: &Location) -> RebuildResult<()> {
    if location.repo.is_empty() {
        return Err(RebuildError::invalid_argument(
            "location hint without repo",
        ));
    }
    if !location.dir.is_empty() && location.git_ref.is_empty() {
        return Err(RebuildError::unimplemented(
            "location hint with dir but no ref",
        ));
    }
    Ok(())
}

/// Resolve the upstream repo for a target: hint first, then registry
/// metadata, both canonicalized.
pub(crate) async fn resolve_repo(
    target: &Target,
    hint: Option<&Location>,
    metadata_repo: Option<String>,
) -> RebuildResult<String> {
    if let Some(hint) = hint {
        return canonicalize_repo_url(&hint.repo);
    }
    match metadata_repo {
        Some(repo) => canonicalize_repo_url(&repo),
        None => Err(RebuildError::not_found(format!(
            "inference failed: no repository known for {target}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_forge_urls() {
        assert_eq!(
            canonicalize_repo_url("git+http://GitHub.com/Abseil/abseil-py.git").unwrap(),
            "https://github.com/abseil/abseil-py"
        );
        assert_eq!(
            canonicalize_repo_url("https://github.com/serde-rs/serde/").unwrap(),
            "https://github.com/serde-rs/serde"
        );
        // unknown hosts keep their scheme
        assert_eq!(
            canonicalize_repo_url("http://git.example.org/repo").unwrap(),
            "http://git.example.org/repo"
        );
        assert!(canonicalize_repo_url("not a url").is_err());
    }

    #[test]
    fn hint_validation() {
        let dir_no_ref = Location {
            repo: "https://github.com/a/b".to_owned(),
            git_ref: String::new(),
            dir: "packages/core".to_owned(),
        };
        assert_eq!(
            validate_hint(&dir_no_ref).unwrap_err().kind(),
            crate::errors::ErrorKind::Unimplemented
        );

        let no_repo = Location::default();
        assert_eq!(
            validate_hint(&no_repo).unwrap_err().kind(),
            crate::errors::ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn tag_candidates_cover_scoped_names() {
        let target = Target::new(Ecosystem::Npm, "@scope/pkg", "1.2.3", "pkg-1.2.3.tgz").unwrap();
        let candidates = tag_candidates(&target);
        assert!(candidates.contains(&"v1.2.3".to_owned()));
        assert!(candidates.contains(&"@scope/pkg@1.2.3".to_owned()));
        assert!(candidates.contains(&"pkg-1.2.3".to_owned()));
    }
}
