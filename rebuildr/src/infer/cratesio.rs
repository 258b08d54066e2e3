//! crates.io heuristic: `cargo package` at a pinned toolchain.

use rebuildr_schema::strategy::{CratesioCargoPackage, Strategy};
use rebuildr_schema::{Location, Target};
use serde::Deserialize;

use super::{pin_ref, resolve_repo};
use crate::errors::RebuildResult;
use crate::gitsource::RepoCloner;
use crate::registry::RegistryMux;

// Crates that declare no rust-version build with the stable that was current
// when they published; this is the floor when even that is unknown.
const FALLBACK_RUST_VERSION: &str = "1.77.0";

#[derive(Deserialize)]
struct CargoManifest {
    package: Option<CargoPackage>,
}

#[derive(Deserialize)]
struct CargoPackage {
    #[serde(rename = "rust-version")]
    rust_version: Option<String>,
}

pub(super) async fn infer(
    target: &Target,
    hint: Option<&Location>,
    registry: &dyn RegistryMux,
    cloner: &dyn RepoCloner,
) -> RebuildResult<Strategy> {
    let meta = registry
        .cratesio_version(&target.package, &target.version)
        .await?;
    let repo = resolve_repo(target, hint, meta.repository.clone()).await?;
    let checkout = cloner
        .checkout(&repo, hint.map(|h| h.git_ref.as_str()).filter(|r| !r.is_empty()))
        .await?;

    let dir = hint.map(|h| h.dir.clone()).unwrap_or_default();
    let manifest_path = if dir.is_empty() {
        "Cargo.toml".to_owned()
    } else {
        format!("{dir}/Cargo.toml")
    };
    let manifest_rust_version = checkout
        .read_file(&manifest_path)
        .ok()
        .and_then(|raw| toml::from_str::<CargoManifest>(&String::from_utf8_lossy(&raw)).ok())
        .and_then(|manifest| manifest.package)
        .and_then(|package| package.rust_version);

    Ok(Strategy::CratesioCargoPackage(CratesioCargoPackage {
        location: Location {
            repo,
            git_ref: pin_ref(
                target,
                checkout.as_ref(),
                hint.map(|h| h.git_ref.as_str()),
            ),
            dir,
        },
        rust_version: meta
            .rust_version
            .or(manifest_rust_version)
            .unwrap_or_else(|| FALLBACK_RUST_VERSION.to_owned()),
        registry_time: meta.published_at,
    }))
}
