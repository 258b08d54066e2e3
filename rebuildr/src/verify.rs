//! The verifier: artifact comparison and attestation assembly.
//!
//! Fetches the rebuilt artifact through the asset store and the upstream
//! artifact from its registry URL, computes both digest variants in a single
//! pass each, and decides equivalence: exact byte equality first, stabilized
//! equality second, nothing else. A match becomes two SLSA-shaped in-toto
//! statements signed into a JSONL bundle; a mismatch becomes a
//! `FailedPrecondition` and no bundle.

use rebuildr_schema::attestation::{
    AttestationBundle, BuildDefinitionClaim, BuildMetadata, Builder, Predicate,
    ResourceDescriptor, RunDetails, Statement, BUILD_TYPE_ARTIFACT_EQUIVALENCE_V01,
    BUILD_TYPE_REBUILD_V01, INTOTO_STATEMENT_TYPE, SLSA_PROVENANCE_TYPE,
};
use rebuildr_schema::strategy::StrategyOneOf;
use rebuildr_schema::{Location, Target};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::assets::{Asset, AssetKind, AssetStore};
use crate::errors::{RebuildError, RebuildResult};
use crate::executor::plan::RemoteBuildOptions;
use crate::executor::BuildOutcome;
use crate::registry::RegistryMux;
use crate::sign::{sign_envelope, AttestationSigner};
use crate::stabilize::{
    summarize_bytes, ArtifactSummary, CustomStabilizer, Stabilizer,
};

/// How a comparison resolved in favor of publishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// The rebuilt bytes equal the upstream bytes
    Exact,
    /// Equality only after stabilization
    Stabilized,
}

/// The two summaries plus the verdict of comparing them.
#[derive(Debug, Clone)]
pub struct ArtifactComparison {
    /// Summary of the rebuilt artifact
    pub rebuilt: ArtifactSummary,
    /// Summary of the upstream artifact
    pub upstream: ArtifactSummary,
    /// How the comparison resolved; `None` is a mismatch
    pub match_kind: Option<MatchKind>,
}

/// Fetch and summarize both sides of the comparison.
pub async fn summarize_artifacts(
    store: &dyn AssetStore,
    registry: &dyn RegistryMux,
    target: &Target,
    upstream_url: &str,
    passes: &[&Stabilizer],
    custom: &[CustomStabilizer],
) -> RebuildResult<ArtifactComparison> {
    let asset = Asset::new(AssetKind::RebuiltArtifact, target.clone());
    let rebuilt_bytes = store.read(&asset).await?;
    let upstream_bytes = registry.fetch_artifact(upstream_url).await?;

    let rebuilt = summarize_bytes(
        &store.url(&asset),
        &rebuilt_bytes,
        target.ecosystem,
        &target.artifact,
        passes,
        custom,
    )?;
    let upstream = summarize_bytes(
        upstream_url,
        &upstream_bytes,
        target.ecosystem,
        &target.artifact,
        passes,
        custom,
    )?;

    let match_kind = if rebuilt.digests == upstream.digests {
        Some(MatchKind::Exact)
    } else if rebuilt.stabilized_digests == upstream.stabilized_digests {
        Some(MatchKind::Stabilized)
    } else {
        None
    };
    info!(%target, ?match_kind, "compared artifacts");
    Ok(ArtifactComparison {
        rebuilt,
        upstream,
        match_kind,
    })
}

/// The signing service's own source identity, embedded at link time.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceIdentity {
    /// Canonicalized repo URL (or `file://` for dev builds)
    pub repo: String,
    /// Service pseudo-version
    pub version: String,
}

/// Where the prebuild tools come from.
#[derive(Debug, Clone, Serialize, Default)]
pub struct PrebuildConfig {
    /// Bucket URL serving the tool binaries
    pub bucket_url: String,
    /// Whether tool fetches are authenticated
    pub auth: bool,
}

/// The overwrite disposition recorded inside attestations. `force` mode
/// deliberately records nothing.
#[derive(Debug, Clone)]
pub enum OverwriteRecord {
    /// Fresh publish, or forced overwrite (no marker)
    None,
    /// Overwrite justified by a service update
    ServiceUpdate {
        /// The service version that signed the replaced bundle
        previous_version: String,
    },
}

/// Everything attestation assembly needs beyond the comparison itself.
pub struct AttestationInputs<'a> {
    /// The attested target
    pub target: &'a Target,
    /// The strategy that produced the rebuild
    pub strategy: &'a StrategyOneOf,
    /// Where the strategy's source is pinned
    pub source_location: &'a Location,
    /// Build-definition provenance, when the strategy came from the repo
    pub build_def: Option<BuildDefProvenance>,
    /// The run id grouping this attempt
    pub run_id: &'a str,
    /// Signing service identity
    pub service: &'a ServiceIdentity,
    /// Prebuild tool source
    pub prebuild: &'a PrebuildConfig,
    /// Build options the executor ran with
    pub options: &'a RemoteBuildOptions,
    /// The finished build
    pub outcome: &'a BuildOutcome,
    /// The comparison that justified publishing
    pub comparison: &'a ArtifactComparison,
    /// Overwrite disposition
    pub overwrite: OverwriteRecord,
}

/// Provenance of a build definition loaded from the definitions repository.
#[derive(Debug, Clone, Serialize)]
pub struct BuildDefProvenance {
    /// Definitions repo URL
    pub repo: String,
    /// Ref the definition was read at
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Path of the YAML inside the repo
    pub path: String,
}

fn internal_parameters(inputs: &AttestationInputs<'_>) -> serde_json::Value {
    let mut params = serde_json::json!({
        "serviceSource": inputs.service,
        "prebuildSource": inputs.prebuild,
    });
    if let OverwriteRecord::ServiceUpdate { previous_version } = &inputs.overwrite {
        params["overwrite"] = serde_json::json!({
            "mode": "service-update",
            "previousVersion": previous_version,
        });
    }
    params
}

fn descriptor(
    name: &str,
    uri: &str,
    digest: BTreeMap<String, String>,
) -> ResourceDescriptor {
    ResourceDescriptor {
        name: Some(name.to_owned()),
        uri: Some(uri.to_owned()),
        digest,
    }
}

/// Assemble the artifact-equivalence and rebuild statements.
pub fn create_attestations(
    inputs: &AttestationInputs<'_>,
) -> RebuildResult<(Statement, Statement)> {
    let comparison = inputs.comparison;
    let match_kind = comparison.match_kind.ok_or_else(|| {
        RebuildError::failed_precondition("refusing to attest a mismatched artifact")
    })?;
    let metadata = BuildMetadata {
        invocation_id: Some(inputs.run_id.to_owned()),
        started_on: Some(inputs.outcome.started_at),
        finished_on: Some(inputs.outcome.finished_at),
    };
    let run_details = RunDetails {
        builder: Builder {
            id: inputs.service.repo.clone(),
        },
        metadata,
    };

    let equivalence = Statement {
        statement_type: INTOTO_STATEMENT_TYPE.to_owned(),
        subject: vec![descriptor(
            &inputs.target.artifact,
            &comparison.upstream.uri,
            comparison.upstream.digest_map(),
        )],
        predicate_type: SLSA_PROVENANCE_TYPE.to_owned(),
        predicate: Predicate {
            build_definition: BuildDefinitionClaim {
                build_type: BUILD_TYPE_ARTIFACT_EQUIVALENCE_V01.to_owned(),
                external_parameters: serde_json::json!({
                    "candidate": comparison.rebuilt.uri,
                    "target": comparison.upstream.uri,
                }),
                internal_parameters: {
                    let mut params = internal_parameters(inputs);
                    params["stabilizers"] =
                        serde_json::json!(comparison.rebuilt.stabilizers);
                    params["match"] = serde_json::json!(match_kind);
                    params
                },
                resolved_dependencies: vec![descriptor(
                    "rebuilt artifact",
                    &comparison.rebuilt.uri,
                    comparison.rebuilt.digest_map(),
                )],
            },
            run_details: run_details.clone(),
        },
    };

    let mut external = serde_json::json!({
        "ecosystem": inputs.target.ecosystem,
        "package": inputs.target.package,
        "version": inputs.target.version,
        "artifact": inputs.target.artifact,
        "strategy": inputs.strategy,
    });
    if let Some(build_def) = &inputs.build_def {
        external["buildDefinition"] = serde_json::json!(build_def);
    }
    let rebuild = Statement {
        statement_type: INTOTO_STATEMENT_TYPE.to_owned(),
        subject: vec![descriptor(
            &inputs.target.artifact,
            &comparison.rebuilt.uri,
            comparison.rebuilt.digest_map(),
        )],
        predicate_type: SLSA_PROVENANCE_TYPE.to_owned(),
        predicate: Predicate {
            build_definition: BuildDefinitionClaim {
                build_type: BUILD_TYPE_REBUILD_V01.to_owned(),
                external_parameters: external,
                internal_parameters: internal_parameters(inputs),
                resolved_dependencies: vec![
                    descriptor(
                        "source",
                        &inputs.source_location.repo,
                        BTreeMap::from([(
                            "gitCommit".to_owned(),
                            inputs.source_location.git_ref.clone(),
                        )]),
                    ),
                    descriptor(
                        "build image",
                        &inputs.options.base_image.image,
                        BTreeMap::from([(
                            "sha256".to_owned(),
                            inputs
                                .options
                                .base_image
                                .digest
                                .trim_start_matches("sha256:")
                                .to_owned(),
                        )]),
                    ),
                ],
            },
            run_details,
        },
    };
    Ok((equivalence, rebuild))
}

/// Sign the two statements and publish the JSONL bundle.
///
/// With `allow_overwrite` off this goes through `write_new`, which is the
/// arbitration point for concurrent publishers of the same target.
pub async fn publish_bundle(
    signer: &dyn AttestationSigner,
    store: &Arc<dyn AssetStore>,
    target: &Target,
    equivalence: &Statement,
    rebuild: &Statement,
    allow_overwrite: bool,
) -> RebuildResult<()> {
    let bundle = AttestationBundle {
        envelopes: vec![
            sign_envelope(signer, equivalence).await?,
            sign_envelope(signer, rebuild).await?,
        ],
    };
    let jsonl = bundle.to_jsonl()?;
    let asset = Asset::new(AssetKind::AttestationBundle, target.clone());
    if allow_overwrite {
        store.write(&asset, &jsonl).await?;
    } else {
        store.write_new(&asset, &jsonl).await?;
    }
    info!(%target, overwrite = allow_overwrite, "published attestation bundle");
    Ok(())
}
