//! The strategy oneof: everything the executor needs to reproduce a target.
//!
//! On the wire a strategy is a struct with one optional field per variant and
//! an "exactly one set" invariant, so that YAML build definitions and JSON
//! request hints share one shape. [`StrategyOneOf::strategy`][] lowers the
//! wire form into the [`Strategy`][] enum and is where the invariant is
//! enforced; [`StrategyOneOf::from`][] is the inverse and always produces a
//! valid oneof.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::Location;

/// Errors lowering a [`StrategyOneOf`][] into a [`Strategy`][].
#[derive(Debug, thiserror::Error)]
pub enum OneOfError {
    /// No variant field was set
    #[error("strategy oneof has no variant set")]
    Empty,
    /// More than one variant field was set
    #[error("strategy oneof has {count} variants set, expected exactly one")]
    Ambiguous {
        /// how many variant fields were non-null
        count: usize,
    },
}

/// The serialized form of a [`Strategy`][]: exactly one field may be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct StrategyOneOf {
    /// An under-specified strategy: just where the source lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_hint: Option<Location>,
    /// npm `pack`-based rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npm_pack_build: Option<NpmPackBuild>,
    /// PyPI wheel rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pypi_wheel_build: Option<PypiWheelBuild>,
    /// crates.io `cargo package` rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cratesio_cargo_package: Option<CratesioCargoPackage>,
    /// Debian binary package rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debian_package: Option<DebianPackage>,
    /// Maven jar rebuild
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maven_build: Option<MavenBuild>,
    /// Hand-authored shell commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_strategy: Option<ManualStrategy>,
    /// Ordered steps in the workflow form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_strategy: Option<WorkflowStrategy>,
}

impl StrategyOneOf {
    /// Lower into the typed enum, enforcing the exactly-one invariant.
    pub fn strategy(&self) -> Result<Strategy, OneOfError> {
        let mut found = Vec::new();
        if let Some(v) = &self.location_hint {
            found.push(Strategy::LocationHint(v.clone()));
        }
        if let Some(v) = &self.npm_pack_build {
            found.push(Strategy::NpmPackBuild(v.clone()));
        }
        if let Some(v) = &self.pypi_wheel_build {
            found.push(Strategy::PypiWheelBuild(v.clone()));
        }
        if let Some(v) = &self.cratesio_cargo_package {
            found.push(Strategy::CratesioCargoPackage(v.clone()));
        }
        if let Some(v) = &self.debian_package {
            found.push(Strategy::DebianPackage(v.clone()));
        }
        if let Some(v) = &self.maven_build {
            found.push(Strategy::MavenBuild(v.clone()));
        }
        if let Some(v) = &self.manual_strategy {
            found.push(Strategy::Manual(v.clone()));
        }
        if let Some(v) = &self.workflow_strategy {
            found.push(Strategy::Workflow(v.clone()));
        }
        match found.len() {
            0 => Err(OneOfError::Empty),
            1 => Ok(found.pop().unwrap()),
            count => Err(OneOfError::Ambiguous { count }),
        }
    }
}

impl From<Strategy> for StrategyOneOf {
    fn from(strategy: Strategy) -> Self {
        let mut oneof = StrategyOneOf::default();
        match strategy {
            Strategy::LocationHint(v) => oneof.location_hint = Some(v),
            Strategy::NpmPackBuild(v) => oneof.npm_pack_build = Some(v),
            Strategy::PypiWheelBuild(v) => oneof.pypi_wheel_build = Some(v),
            Strategy::CratesioCargoPackage(v) => oneof.cratesio_cargo_package = Some(v),
            Strategy::DebianPackage(v) => oneof.debian_package = Some(v),
            Strategy::MavenBuild(v) => oneof.maven_build = Some(v),
            Strategy::Manual(v) => oneof.manual_strategy = Some(v),
            Strategy::Workflow(v) => oneof.workflow_strategy = Some(v),
        }
        oneof
    }
}

/// How to reproduce one target.
///
/// Strategies are inferred per request or loaded from a build-definition
/// repository, and persisted only inside attestations.
#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    /// Only the source location is known; inference fills in the rest
    LocationHint(Location),
    /// npm `pack`-based rebuild
    NpmPackBuild(NpmPackBuild),
    /// PyPI wheel rebuild
    PypiWheelBuild(PypiWheelBuild),
    /// crates.io `cargo package` rebuild
    CratesioCargoPackage(CratesioCargoPackage),
    /// Debian binary package rebuild
    DebianPackage(DebianPackage),
    /// Maven jar rebuild
    MavenBuild(MavenBuild),
    /// Hand-authored shell commands
    Manual(ManualStrategy),
    /// Ordered steps in the workflow form
    Workflow(WorkflowStrategy),
}

impl Strategy {
    /// Where this strategy's source lives.
    pub fn location(&self) -> &Location {
        match self {
            Strategy::LocationHint(loc) => loc,
            Strategy::NpmPackBuild(v) => &v.location,
            Strategy::PypiWheelBuild(v) => &v.location,
            Strategy::CratesioCargoPackage(v) => &v.location,
            Strategy::DebianPackage(v) => &v.location,
            Strategy::MavenBuild(v) => &v.location,
            Strategy::Manual(v) => &v.location,
            Strategy::Workflow(v) => &v.location,
        }
    }

    /// Stable name for logs and attempt records.
    pub fn kind(&self) -> &'static str {
        match self {
            Strategy::LocationHint(_) => "location_hint",
            Strategy::NpmPackBuild(_) => "npm_pack_build",
            Strategy::PypiWheelBuild(_) => "pypi_wheel_build",
            Strategy::CratesioCargoPackage(_) => "cratesio_cargo_package",
            Strategy::DebianPackage(_) => "debian_package",
            Strategy::MavenBuild(_) => "maven_build",
            Strategy::Manual(_) => "manual_strategy",
            Strategy::Workflow(_) => "workflow_strategy",
        }
    }

    /// The registry publish time, for recipes whose tooling reads the clock.
    pub fn registry_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Strategy::NpmPackBuild(v) => v.registry_time,
            Strategy::PypiWheelBuild(v) => v.registry_time,
            Strategy::CratesioCargoPackage(v) => v.registry_time,
            _ => None,
        }
    }
}

/// Rebuild an npm tarball with `npm pack` at a pinned toolchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NpmPackBuild {
    /// Pinned source location
    pub location: Location,
    /// npm version to install and pack with
    pub npm_version: String,
    /// When the registry says this version was published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_time: Option<DateTime<Utc>>,
}

/// Rebuild a PyPI wheel with `python -m build`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PypiWheelBuild {
    /// Pinned source location
    pub location: Location,
    /// Extra requirement specs installed before building
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requirements: Vec<String>,
    /// When the registry says this version was published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_time: Option<DateTime<Utc>>,
}

/// Rebuild a .crate tarball with `cargo package` at a pinned toolchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CratesioCargoPackage {
    /// Pinned source location
    pub location: Location,
    /// Rust toolchain version
    pub rust_version: String,
    /// When the registry says this version was published
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_time: Option<DateTime<Utc>>,
}

/// A source file plus the checksum the registry published for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FileWithChecksum {
    /// Where to fetch the file
    pub url: String,
    /// Hex digest the fetched bytes must match
    pub checksum: String,
}

/// Rebuild a Debian binary package from its source package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DebianPackage {
    /// Pinned source location
    pub location: Location,
    /// Archive component (main, contrib, non-free)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub component: String,
    /// The .dsc source control file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsc: Option<FileWithChecksum>,
    /// The upstream .orig tarball (absent for native packages)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orig: Option<FileWithChecksum>,
    /// The .debian packaging tarball
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debian: Option<FileWithChecksum>,
    /// Whether this is a native package (single tarball, no .orig)
    #[serde(default)]
    pub native: bool,
}

/// Rebuild a Maven jar at a pinned JDK.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MavenBuild {
    /// Pinned source location
    pub location: Location,
    /// JDK major version to build with
    pub jdk_version: String,
}

/// Hand-authored build commands; the escape hatch when no recipe fits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ManualStrategy {
    /// Pinned source location
    pub location: Location,
    /// Shell command installing build dependencies
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub deps: String,
    /// Shell command producing the artifact
    pub build: String,
    /// System packages the build requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_deps: Vec<String>,
    /// Path of the produced artifact, relative to the source dir
    pub output_path: String,
}

/// One step in a [`WorkflowStrategy`][].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStep {
    /// Shell command to run
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runs: String,
    /// Name of a predefined tool step to run instead of a command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,
    /// Arguments for the tool step
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
}

/// An ordered-steps strategy, the form strategy-proposing agents emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WorkflowStrategy {
    /// Pinned source location
    pub location: Location,
    /// Steps preparing the source tree
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_setup: Vec<WorkflowStep>,
    /// Steps installing dependencies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deps: Vec<WorkflowStep>,
    /// Steps producing the artifact
    pub build: Vec<WorkflowStep>,
    /// Path of the produced artifact, relative to the source dir
    pub output_path: String,
}

/// Configuration for one custom stabilizer in a build definition.
///
/// Shaped like a oneof for the same reason [`StrategyOneOf`][] is: YAML
/// authors set exactly one of the variant fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CustomStabilizerEntry {
    /// Regex substitution applied inside matching entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replace_pattern: Option<ReplacePatternConfig>,
    /// Drop matching entries entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_path: Option<ExcludePathConfig>,
    /// Why this transform is sound for this package, for auditability
    pub reason: String,
}

/// Regex substitution inside archive entries whose paths match a glob set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReplacePatternConfig {
    /// Globs selecting the entries to rewrite
    pub paths: Vec<String>,
    /// Regex to search for
    pub pattern: String,
    /// Replacement text
    pub replace: String,
}

/// Drop archive entries whose paths match a glob set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ExcludePathConfig {
    /// Globs selecting the entries to drop
    pub paths: Vec<String>,
}

/// A user-authored override of inferred strategy and/or extra stabilizers,
/// stored as YAML in the build-definition repository at a path derived from
/// the target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BuildDefinition {
    /// Full strategy, or a bare location hint forwarded to inference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyOneOf>,
    /// Extra content-preserving transforms applied before comparison
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_stabilizers: Vec<CustomStabilizerEntry>,
}

impl BuildDefinition {
    /// True if the definition carries a full strategy (not just a hint).
    pub fn has_full_strategy(&self) -> bool {
        matches!(
            self.strategy.as_ref().map(|oneof| oneof.strategy()),
            Some(Ok(strategy)) if !matches!(strategy, Strategy::LocationHint(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_location() -> Location {
        Location {
            repo: "https://github.com/abseil/abseil-py".to_owned(),
            git_ref: "2f6b41ad29ba6f24c4ebbb4b7cde1a5a4c7ba179".to_owned(),
            dir: String::new(),
        }
    }

    fn sample_strategies() -> Vec<Strategy> {
        vec![
            Strategy::LocationHint(sample_location()),
            Strategy::NpmPackBuild(NpmPackBuild {
                location: sample_location(),
                npm_version: "10.2.4".to_owned(),
                registry_time: Some("2023-11-01T12:30:00Z".parse().unwrap()),
            }),
            Strategy::PypiWheelBuild(PypiWheelBuild {
                location: sample_location(),
                requirements: vec!["setuptools==68.0.0".to_owned(), "wheel".to_owned()],
                registry_time: None,
            }),
            Strategy::CratesioCargoPackage(CratesioCargoPackage {
                location: sample_location(),
                rust_version: "1.76.0".to_owned(),
                registry_time: None,
            }),
            Strategy::DebianPackage(DebianPackage {
                location: sample_location(),
                component: "main".to_owned(),
                dsc: Some(FileWithChecksum {
                    url: "https://deb.debian.org/pool/main/x/xz-utils.dsc".to_owned(),
                    checksum: "0b0f".to_owned(),
                }),
                orig: None,
                debian: None,
                native: true,
            }),
            Strategy::MavenBuild(MavenBuild {
                location: sample_location(),
                jdk_version: "17".to_owned(),
            }),
            Strategy::Manual(ManualStrategy {
                location: sample_location(),
                deps: "npm ci".to_owned(),
                build: "npm pack".to_owned(),
                system_deps: vec!["git".to_owned()],
                output_path: "absl-py-2.0.0.tgz".to_owned(),
            }),
            Strategy::Workflow(WorkflowStrategy {
                location: sample_location(),
                source_setup: vec![],
                deps: vec![WorkflowStep {
                    runs: "pip install build".to_owned(),
                    uses: None,
                    with: BTreeMap::new(),
                }],
                build: vec![WorkflowStep {
                    runs: "python -m build --wheel".to_owned(),
                    uses: None,
                    with: BTreeMap::new(),
                }],
                output_path: "dist/absl_py-2.0.0-py3-none-any.whl".to_owned(),
            }),
        ]
    }

    #[test]
    fn oneof_roundtrip_json_and_yaml() {
        for strategy in sample_strategies() {
            let oneof = StrategyOneOf::from(strategy.clone());

            let json = serde_json::to_string(&oneof).unwrap();
            let from_json: StrategyOneOf = serde_json::from_str(&json).unwrap();
            assert_eq!(from_json, oneof);
            assert_eq!(from_json.strategy().unwrap(), strategy);

            let yaml = serde_yml::to_string(&oneof).unwrap();
            let from_yaml: StrategyOneOf = serde_yml::from_str(&yaml).unwrap();
            assert_eq!(from_yaml, oneof);
            assert_eq!(from_yaml.strategy().unwrap(), strategy);
        }
    }

    #[test]
    fn location_hint_wire_shape() {
        let oneof = StrategyOneOf::from(Strategy::LocationHint(sample_location()));
        insta::assert_snapshot!(serde_json::to_string_pretty(&oneof).unwrap(), @r#"
        {
          "location_hint": {
            "repo": "https://github.com/abseil/abseil-py",
            "ref": "2f6b41ad29ba6f24c4ebbb4b7cde1a5a4c7ba179"
          }
        }
        "#);
    }

    #[test]
    fn oneof_rejects_zero_and_many() {
        let empty = StrategyOneOf::default();
        assert!(matches!(empty.strategy(), Err(OneOfError::Empty)));

        let mut doubled = StrategyOneOf::from(Strategy::LocationHint(sample_location()));
        doubled.maven_build = Some(MavenBuild {
            location: sample_location(),
            jdk_version: "17".to_owned(),
        });
        assert!(matches!(
            doubled.strategy(),
            Err(OneOfError::Ambiguous { count: 2 })
        ));
    }

    #[test]
    fn build_definition_yaml() {
        let yaml = r#"
strategy:
  cratesio_cargo_package:
    location:
      repo: https://github.com/serde-rs/serde
      ref: v1.0.200
    rust_version: 1.77.0
custom_stabilizers:
  - exclude_path:
      paths: ["*/.cargo_vcs_info.json"]
    reason: vcs info embeds the packaging checkout
"#;
        let def: BuildDefinition = serde_yml::from_str(yaml).unwrap();
        assert!(def.has_full_strategy());
        assert_eq!(def.custom_stabilizers.len(), 1);

        let hint_only = BuildDefinition {
            strategy: Some(StrategyOneOf::from(Strategy::LocationHint(
                sample_location(),
            ))),
            custom_stabilizers: vec![],
        };
        assert!(!hint_only.has_full_strategy());
    }
}
