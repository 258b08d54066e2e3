//! PyPI heuristic: build the wheel with `python -m build` plus whatever the
//! project's build-system table asks for.

use rebuildr_schema::strategy::{PypiWheelBuild, Strategy};
use rebuildr_schema::{Location, Target};
use serde::Deserialize;

use super::{pin_ref, resolve_repo};
use crate::errors::RebuildResult;
use crate::gitsource::RepoCloner;
use crate::registry::RegistryMux;

#[derive(Deserialize)]
struct PyProject {
    #[serde(rename = "build-system")]
    build_system: Option<BuildSystem>,
}

#[derive(Deserialize)]
struct BuildSystem {
    #[serde(default)]
    requires: Vec<String>,
}

pub(super) async fn infer(
    target: &Target,
    hint: Option<&Location>,
    registry: &dyn RegistryMux,
    cloner: &dyn RepoCloner,
) -> RebuildResult<Strategy> {
    let meta = registry
        .pypi_release(&target.package, &target.version)
        .await?;
    let wheel = meta
        .files
        .iter()
        .find(|f| f.filename == target.artifact)
        .map(Ok)
        .unwrap_or_else(|| meta.pick_pure_wheel())?;
    let registry_time = wheel.uploaded_at;

    let repo = resolve_repo(target, hint, meta.repository.clone()).await?;
    let checkout = cloner
        .checkout(&repo, hint.map(|h| h.git_ref.as_str()).filter(|r| !r.is_empty()))
        .await?;

    let dir = hint.map(|h| h.dir.clone()).unwrap_or_default();
    let pyproject_path = if dir.is_empty() {
        "pyproject.toml".to_owned()
    } else {
        format!("{dir}/pyproject.toml")
    };

    // build-system requires from pyproject; setup.py-only projects get the
    // setuptools baseline
    let mut requirements = vec!["build".to_owned()];
    match checkout.read_file(&pyproject_path) {
        Ok(raw) => {
            if let Ok(pyproject) = toml::from_str::<PyProject>(&String::from_utf8_lossy(&raw)) {
                if let Some(build_system) = pyproject.build_system {
                    requirements.extend(build_system.requires);
                }
            }
        }
        Err(_) => {
            requirements.push("setuptools".to_owned());
            requirements.push("wheel".to_owned());
        }
    }

    Ok(Strategy::PypiWheelBuild(PypiWheelBuild {
        location: Location {
            repo,
            git_ref: pin_ref(
                target,
                checkout.as_ref(),
                hint.map(|h| h.git_ref.as_str()),
            ),
            dir,
        },
        requirements,
        registry_time,
    }))
}
