//! Maven heuristic: build the jar at a pinned JDK from the pom's scm link.

use rebuildr_schema::strategy::{MavenBuild, Strategy};
use rebuildr_schema::{Location, Target};

use super::{pin_ref, resolve_repo};
use crate::errors::RebuildResult;
use crate::gitsource::RepoCloner;
use crate::registry::RegistryMux;

const DEFAULT_JDK_VERSION: &str = "17";

pub(super) async fn infer(
    target: &Target,
    hint: Option<&Location>,
    registry: &dyn RegistryMux,
    cloner: &dyn RepoCloner,
) -> RebuildResult<Strategy> {
    let meta = registry
        .maven_artifact(&target.package, &target.version)
        .await?;
    let repo = resolve_repo(target, hint, meta.scm_url.clone()).await?;
    let checkout = cloner
        .checkout(&repo, hint.map(|h| h.git_ref.as_str()).filter(|r| !r.is_empty()))
        .await?;

    Ok(Strategy::MavenBuild(MavenBuild {
        location: Location {
            repo,
            git_ref: pin_ref(
                target,
                checkout.as_ref(),
                hint.map(|h| h.git_ref.as_str()),
            ),
            dir: hint.map(|h| h.dir.clone()).unwrap_or_default(),
        },
        jdk_version: DEFAULT_JDK_VERSION.to_owned(),
    }))
}
