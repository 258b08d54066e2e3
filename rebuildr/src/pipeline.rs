//! The rebuild pipeline orchestrator.
//!
//! One attempt is a small state machine: check for an existing bundle and
//! arbitrate overwrites, acquire a strategy (caller-supplied, build-def repo,
//! or inference), run the remote build, compare against upstream, and on a
//! match sign and publish the bundle. Every terminal state writes an attempt
//! row, best-effort. Errors other than client mistakes are encoded into the
//! verdict rather than failing the request.

use chrono::Utc;
use rebuildr_schema::strategy::{BuildDefinition, Strategy, StrategyOneOf};
use rebuildr_schema::{Ecosystem, Target};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::assets::{Asset, AssetKind, AssetStore};
use crate::attempts::{AttemptStore, RebuildAttempt};
use crate::changelog::{overwrite_eligible, validate_pseudo_version};
use crate::context::RequestContext;
use crate::errors::{ErrorKind, RebuildError, RebuildResult};
use crate::executor::plan::RemoteBuildOptions;
use crate::executor::RemoteBuildExecutor;
use crate::gitsource::RepoCloner;
use crate::infer::InferenceService;
use crate::registry::RegistryMux;
use crate::sign::{verify_envelope, AttestationSigner};
use crate::stabilize::{compile_custom_stabilizers, default_stabilizers, CustomStabilizer};
use crate::verify::{
    create_attestations, publish_bundle, summarize_artifacts, AttestationInputs,
    BuildDefProvenance, MatchKind, OverwriteRecord, PrebuildConfig, ServiceIdentity,
};
use rebuildr_schema::attestation::BUILD_TYPE_REBUILD_V01;

/// How an attempt may treat an existing bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverwriteMode {
    /// Deny if a bundle exists
    #[default]
    None,
    /// Overwrite unconditionally; the attestation carries no marker
    Force,
    /// Overwrite only across an attestation-impacting service update
    ServiceUpdate,
}

impl FromStr for OverwriteMode {
    type Err = RebuildError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Ok(OverwriteMode::None),
            "force" => Ok(OverwriteMode::Force),
            "service-update" => Ok(OverwriteMode::ServiceUpdate),
            other => Err(RebuildError::invalid_argument(format!(
                "unknown overwrite mode: {other}"
            ))),
        }
    }
}

/// One rebuild request, as the HTTP layer hands it to the orchestrator.
#[derive(Debug, Clone)]
pub struct RebuildRequest {
    /// What to rebuild
    pub target: Target,
    /// Load the strategy from the build-definition repository first
    pub strategy_from_repo: bool,
    /// Route build egress through the network proxy
    pub use_network_proxy: bool,
    /// Run the syscall monitor alongside the build
    pub use_syscall_monitor: bool,
    /// Overwrite disposition
    pub overwrite: OverwriteMode,
    /// Build timeout override
    pub build_timeout: Option<Duration>,
    /// Caller-supplied strategy (the pluggable strategy-source entry point)
    pub strategy: Option<StrategyOneOf>,
}

impl RebuildRequest {
    /// A plain request for `target` with default knobs.
    pub fn new(target: Target) -> Self {
        RebuildRequest {
            target,
            strategy_from_repo: false,
            use_network_proxy: false,
            use_syscall_monitor: false,
            overwrite: OverwriteMode::None,
            build_timeout: None,
            strategy: None,
        }
    }
}

/// The terminal answer for one attempt.
#[derive(Debug, Clone)]
pub struct Verdict {
    /// The target the attempt ran against (epoch guessing may refine the
    /// requested version)
    pub target: Target,
    /// Empty on success; the error or mismatch otherwise
    pub message: String,
    /// The strategy the attempt used, once known
    pub strategy: Option<StrategyOneOf>,
    /// How the comparison resolved, when it got that far
    pub match_kind: Option<MatchKind>,
    /// The error kind encoded in `message`, if any
    pub error_kind: Option<ErrorKind>,
}

/// Where build definitions live.
#[derive(Debug, Clone)]
pub struct BuildDefRepo {
    /// Repository URL
    pub repo: String,
    /// Ref definitions are read at
    pub git_ref: String,
}

/// Path of a target's build definition inside the definitions repo. Pure
/// function of the target, like every asset path.
pub fn build_definition_path(target: &Target) -> String {
    format!(
        "definitions/{}/{}/{}/{}.yaml",
        target.ecosystem,
        target.encoded_package(),
        target.version,
        target.artifact
    )
}

/// The assembled orchestrator.
pub struct RebuildPipeline {
    /// Registry metadata access
    pub registry: Arc<dyn RegistryMux>,
    /// Strategy inference
    pub inference: Arc<InferenceService>,
    /// Remote build execution
    pub executor: Arc<RemoteBuildExecutor>,
    /// Store the worker uploads rebuilt artifacts through
    pub remote_store: Arc<dyn AssetStore>,
    /// Store attestation bundles publish to
    pub attestation_store: Arc<dyn AssetStore>,
    /// Local store for debug assets (dockerfile, logs)
    pub debug_store: Arc<dyn AssetStore>,
    /// Attestation signing key
    pub signer: Arc<dyn AttestationSigner>,
    /// Durable attempt rows
    pub attempts: Arc<dyn AttemptStore>,
    /// Read-only cloner for the build-definition repository
    pub cloner: Arc<dyn RepoCloner>,
    /// This service's identity, as embedded in attestations
    pub service: ServiceIdentity,
    /// Prebuild tool source
    pub prebuild: PrebuildConfig,
    /// Build-definition repository, if configured
    pub build_def_repo: Option<BuildDefRepo>,
    /// Baseline executor options (upload base, base image, tool urls)
    pub build_options: RemoteBuildOptions,
}

struct Scratch {
    target: Target,
    row: RebuildAttempt,
    strategy: Option<StrategyOneOf>,
    match_kind: Option<MatchKind>,
}

impl RebuildPipeline {
    /// Validate startup-fatal configuration. Call before serving.
    pub fn check_startup(&self) -> RebuildResult<()> {
        validate_pseudo_version(&self.service.version)?;
        Ok(())
    }

    /// Run one full rebuild attempt for `req`.
    ///
    /// Client mistakes (`InvalidArgument`) fail the call; everything else is
    /// encoded into the verdict so the attempt row and the HTTP body agree.
    pub async fn rebuild_package(
        &self,
        ctx: &RequestContext,
        req: &RebuildRequest,
    ) -> RebuildResult<Verdict> {
        req.target.validate()?;
        let mut scratch = Scratch {
            target: req.target.clone(),
            row: RebuildAttempt::started(&req.target, &ctx.run_id, Utc::now()),
            strategy: None,
            match_kind: None,
        };
        scratch.row.executor_version = self.executor.version().to_owned();

        let verdict = match self.attempt(ctx, req, &mut scratch).await {
            Ok(verdict) => verdict,
            Err(err) if err.kind() == ErrorKind::InvalidArgument => return Err(err),
            Err(err) => Verdict {
                target: scratch.target.clone(),
                message: err.to_string(),
                strategy: scratch.strategy.clone(),
                match_kind: scratch.match_kind,
                error_kind: Some(err.kind()),
            },
        };

        scratch.row.success = verdict.error_kind.is_none();
        scratch.row.message = verdict.message.clone();
        scratch.row.match_kind = verdict.match_kind;
        scratch.row.finished_at = Utc::now();
        scratch.row.version = verdict.target.version.clone();
        if let Err(err) = self.attempts.record(&scratch.row).await {
            warn!(run_id = %ctx.run_id, "failed to record attempt: {err}");
        }
        Ok(verdict)
    }

    async fn attempt(
        &self,
        ctx: &RequestContext,
        req: &RebuildRequest,
        scratch: &mut Scratch,
    ) -> RebuildResult<Verdict> {
        // Debian versions are frequently published with an implicit epoch;
        // retry the metadata lookup with 1: before giving up.
        if scratch.target.ecosystem == Ecosystem::Debian
            && !scratch.target.version.contains(':')
        {
            let lookup = self
                .registry
                .debian_source(&scratch.target.package, &scratch.target.version)
                .await;
            if let Err(err) = lookup {
                if err.kind() == ErrorKind::NotFound {
                    let guessed = format!("1:{}", scratch.target.version);
                    if self
                        .registry
                        .debian_source(&scratch.target.package, &guessed)
                        .await
                        .is_ok()
                    {
                        info!(target = %scratch.target, %guessed, "guessed debian epoch");
                        scratch.target.version = guessed;
                    }
                }
            }
        }
        let target = scratch.target.clone();

        // CHECK_EXISTING / ARBITRATE_OVERWRITE. When no bundle exists,
        // overwrite is forced off for the whole attempt so concurrent
        // publishers serialize on the store's create-if-not-exists write.
        let bundle_asset = Asset::new(AssetKind::AttestationBundle, target.clone());
        let exists = self.attestation_store.exists(&bundle_asset).await?;
        let (allow_overwrite, overwrite_record) = if exists {
            match req.overwrite {
                OverwriteMode::None => {
                    return Err(RebuildError::already_exists(format!(
                        "attestation bundle for {target}"
                    )))
                }
                OverwriteMode::Force => (true, OverwriteRecord::None),
                OverwriteMode::ServiceUpdate => {
                    let previous = self.previous_attesting_version(&bundle_asset).await?;
                    if !overwrite_eligible(&previous, &self.service.version) {
                        return Err(RebuildError::already_exists(format!(
                            "attestation bundle for {target}: no attestation-impacting change since {previous}"
                        )));
                    }
                    (
                        true,
                        OverwriteRecord::ServiceUpdate {
                            previous_version: previous,
                        },
                    )
                }
            }
        } else {
            (false, OverwriteRecord::None)
        };

        // GET_STRATEGY
        let (strategy, build_def, custom) = self.acquire_strategy(req, &target).await?;
        let strategy_oneof = StrategyOneOf::from(strategy.clone());
        scratch.strategy = Some(strategy_oneof.clone());
        scratch.row.strategy_kind = strategy.kind().to_owned();

        // BUILD
        let mut options = self.build_options.clone();
        options.use_network_proxy = req.use_network_proxy;
        options.use_syscall_monitor = req.use_syscall_monitor;
        if let Some(timeout) = req.build_timeout {
            options.timeout = timeout;
        }
        let handle = self.executor.start(ctx, &target, &strategy, &options).await?;
        let dockerfile_asset = Asset::new(AssetKind::Dockerfile, target.clone());
        if let Err(err) = self
            .debug_store
            .write(&dockerfile_asset, handle.dockerfile().as_bytes())
            .await
        {
            warn!("failed to copy dockerfile debug asset: {err}");
        }
        let steps_asset = Asset::new(AssetKind::BuildSteps, target.clone());
        match serde_json::to_vec_pretty(handle.steps()) {
            Ok(steps) => {
                if let Err(err) = self.debug_store.write(&steps_asset, &steps).await {
                    warn!("failed to copy build-steps debug asset: {err}");
                }
            }
            Err(err) => warn!("failed to serialize build steps: {err}"),
        }
        scratch.row.dockerfile = handle.dockerfile().to_owned();
        let outcome = handle.wait(ctx).await?;
        scratch.row.build_id = outcome.build_id.clone();

        // COMPARE
        let upstream_url = self.registry.artifact_url(&target).await?;
        let passes = default_stabilizers(Some(target.ecosystem));
        let comparison = summarize_artifacts(
            self.remote_store.as_ref(),
            self.registry.as_ref(),
            &target,
            &upstream_url,
            &passes,
            &custom,
        )
        .await?;
        scratch.match_kind = comparison.match_kind;
        let Some(match_kind) = comparison.match_kind else {
            return Err(RebuildError::failed_precondition(format!(
                "rebuild content mismatch for {target}"
            )));
        };

        // SIGN / PUBLISH
        let inputs = AttestationInputs {
            target: &target,
            strategy: &strategy_oneof,
            source_location: strategy.location(),
            build_def,
            run_id: &ctx.run_id,
            service: &self.service,
            prebuild: &self.prebuild,
            options: &options,
            outcome: &outcome,
            comparison: &comparison,
            overwrite: overwrite_record,
        };
        let (equivalence, rebuild) = create_attestations(&inputs)?;
        publish_bundle(
            self.signer.as_ref(),
            &self.attestation_store,
            &target,
            &equivalence,
            &rebuild,
            allow_overwrite,
        )
        .await?;

        Ok(Verdict {
            target,
            message: String::new(),
            strategy: Some(strategy_oneof),
            match_kind: Some(match_kind),
            error_kind: None,
        })
    }

    // Read the service version out of the existing bundle's rebuild
    // statement; the envelope is verified before the field is trusted.
    async fn previous_attesting_version(&self, bundle_asset: &Asset) -> RebuildResult<String> {
        let raw = self.attestation_store.read(bundle_asset).await?;
        let bundle = rebuildr_schema::attestation::AttestationBundle::from_jsonl(&raw)?;
        let (idx, _) = bundle
            .statement_with_build_type(BUILD_TYPE_REBUILD_V01)
            .ok_or_else(|| {
                RebuildError::failed_precondition("existing bundle has no rebuild attestation")
            })?;
        let statement = verify_envelope(self.signer.as_ref(), &bundle.envelopes[idx])?;
        let version = statement.predicate.build_definition.internal_parameters["serviceSource"]
            ["version"]
            .as_str()
            .ok_or_else(|| {
                RebuildError::failed_precondition(
                    "existing bundle does not record a service version",
                )
            })?
            .to_owned();
        validate_pseudo_version(&version)?;
        Ok(version)
    }

    async fn acquire_strategy(
        &self,
        req: &RebuildRequest,
        target: &Target,
    ) -> RebuildResult<(Strategy, Option<BuildDefProvenance>, Vec<CustomStabilizer>)> {
        // caller-supplied strategy wins (the agent entry point)
        if let Some(oneof) = &req.strategy {
            return Ok((oneof.strategy()?, None, Vec::new()));
        }

        let mut hint: Option<StrategyOneOf> = None;
        let mut build_def: Option<BuildDefProvenance> = None;
        let mut custom = Vec::new();

        if req.strategy_from_repo {
            let repo = self.build_def_repo.as_ref().ok_or_else(|| {
                RebuildError::failed_precondition("no build-definition repository configured")
            })?;
            let checkout = self.cloner.checkout(&repo.repo, Some(&repo.git_ref)).await?;
            let path = build_definition_path(target);
            match checkout.read_file(&path) {
                Ok(raw) => {
                    let definition: BuildDefinition =
                        serde_yml::from_str(&String::from_utf8_lossy(&raw))?;
                    custom = compile_custom_stabilizers(&definition.custom_stabilizers)?;
                    build_def = Some(BuildDefProvenance {
                        repo: repo.repo.clone(),
                        git_ref: checkout.head_commit().to_owned(),
                        path: path.clone(),
                    });
                    // a full strategy is used as-is; a bare hint is forwarded
                    // to inference below
                    if let Some(oneof) = definition.strategy {
                        match oneof.strategy()? {
                            Strategy::LocationHint(_) => hint = Some(oneof),
                            full => return Ok((full, build_def, custom)),
                        }
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    info!(%target, "no build definition at {path}");
                }
                Err(err) => return Err(err),
            }
        }

        let oneof = self.inference.infer(target, hint.as_ref()).await?;
        match oneof.strategy()? {
            Strategy::LocationHint(_) => Err(RebuildError::internal(
                "inference returned an unbuildable location hint",
            )),
            strategy => Ok((strategy, build_def, custom)),
        }
    }

    /// Run `versions` of one package through the pipeline and report a
    /// verdict per version. An empty list means "the most recent N".
    pub async fn smoketest(
        &self,
        ctx: &RequestContext,
        ecosystem: Ecosystem,
        package: &str,
        versions: Vec<String>,
        version_count: usize,
    ) -> RebuildResult<Vec<Verdict>> {
        let versions = if versions.is_empty() {
            self.registry
                .recent_versions(ecosystem, package, version_count)
                .await?
        } else {
            versions
        };
        let mut verdicts = Vec::with_capacity(versions.len());
        for version in versions {
            let artifact = self.default_artifact(ecosystem, package, &version).await?;
            let target = Target::new(ecosystem, package, &version, &artifact)?;
            let verdict = self
                .rebuild_package(ctx, &RebuildRequest::new(target))
                .await?;
            verdicts.push(verdict);
        }
        Ok(verdicts)
    }

    /// The conventional artifact filename for a version, when the caller
    /// names none.
    pub async fn default_artifact(
        &self,
        ecosystem: Ecosystem,
        package: &str,
        version: &str,
    ) -> RebuildResult<String> {
        match ecosystem {
            Ecosystem::Npm => {
                let bare = package.rsplit('/').next().unwrap_or(package);
                Ok(format!("{bare}-{version}.tgz"))
            }
            Ecosystem::Pypi => {
                let release = self.registry.pypi_release(package, version).await?;
                Ok(release.pick_pure_wheel()?.filename.clone())
            }
            Ecosystem::Cratesio => Ok(format!("{package}-{version}.crate")),
            Ecosystem::Debian => {
                let pool_version = version.split_once(':').map(|(_, v)| v).unwrap_or(version);
                Ok(format!("{package}_{pool_version}_amd64.deb"))
            }
            Ecosystem::Maven => {
                let artifact = package.rsplit(':').next().unwrap_or(package);
                Ok(format!("{artifact}-{version}.jar"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_mode_parsing() {
        assert_eq!("".parse::<OverwriteMode>().unwrap(), OverwriteMode::None);
        assert_eq!(
            "force".parse::<OverwriteMode>().unwrap(),
            OverwriteMode::Force
        );
        assert_eq!(
            "service-update".parse::<OverwriteMode>().unwrap(),
            OverwriteMode::ServiceUpdate
        );
        assert!("sometimes".parse::<OverwriteMode>().is_err());
    }

    #[test]
    fn build_definition_paths_are_pure() {
        let target = Target::new(
            Ecosystem::Npm,
            "@types/node",
            "20.1.0",
            "node-20.1.0.tgz",
        )
        .unwrap();
        assert_eq!(
            build_definition_path(&target),
            "definitions/npm/@types!node/20.1.0/node-20.1.0.tgz.yaml"
        );
    }
}
