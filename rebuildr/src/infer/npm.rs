//! npm heuristic: `npm pack` at the npm version that produced the publish.

use rebuildr_schema::strategy::{NpmPackBuild, Strategy};
use rebuildr_schema::{Location, Target};

use super::{pin_ref, resolve_repo};
use crate::errors::{RebuildError, RebuildResult};
use crate::gitsource::RepoCloner;
use crate::registry::RegistryMux;

// Publishes predating the _npmVersion field get a modern npm.
const FALLBACK_NPM_VERSION: &str = "10.8.2";

pub(super) async fn infer(
    target: &Target,
    hint: Option<&Location>,
    registry: &dyn RegistryMux,
    cloner: &dyn RepoCloner,
) -> RebuildResult<Strategy> {
    let meta = registry.npm_version(&target.package, &target.version).await?;
    let repo = resolve_repo(target, hint, meta.repository.clone()).await?;
    let checkout = cloner
        .checkout(&repo, hint.map(|h| h.git_ref.as_str()).filter(|r| !r.is_empty()))
        .await?;

    let dir = hint.map(|h| h.dir.clone()).unwrap_or_default();
    let manifest_path = if dir.is_empty() {
        "package.json".to_owned()
    } else {
        format!("{dir}/package.json")
    };
    let manifest = checkout.read_file(&manifest_path).map_err(|_| {
        RebuildError::not_found(format!(
            "inference failed: no package.json at {manifest_path} in {repo}"
        ))
    })?;
    let manifest: serde_json::Value = serde_json::from_slice(&manifest)?;
    if let Some(name) = manifest["name"].as_str() {
        if name != target.package {
            return Err(RebuildError::failed_precondition(format!(
                "inference failed: manifest names {name}, wanted {}",
                target.package
            )));
        }
    }

    Ok(Strategy::NpmPackBuild(NpmPackBuild {
        location: Location {
            repo,
            git_ref: pin_ref(
                target,
                checkout.as_ref(),
                hint.map(|h| h.git_ref.as_str()),
            ),
            dir,
        },
        npm_version: meta
            .npm_version
            .unwrap_or_else(|| FALLBACK_NPM_VERSION.to_owned()),
        registry_time: meta.published_at,
    }))
}
