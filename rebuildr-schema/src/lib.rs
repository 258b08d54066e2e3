#![deny(missing_docs)]

//! # rebuildr-schema
//!
//! This crate exists to serialize and deserialize the wire formats shared by
//! the rebuildr service, its remote build workers, and downstream consumers of
//! attestation bundles: the [`Target`][] identifying a package artifact, the
//! [`strategy::StrategyOneOf`][] describing how to reproduce it, and the
//! signed in-toto statements in [`attestation`][].
//!
//! Ideally it should be reasonably forward and backward compatible with
//! different versions of these formats, so be careful about breaking changes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod attestation;
pub mod strategy;

/// The package ecosystems rebuildr knows how to rebuild.
///
/// This is a closed set; adding a member is a wire-format change that every
/// asset path and attestation references, so treat it like one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    /// npm registry packages (tgz tarballs)
    Npm,
    /// PyPI packages (wheels and sdists)
    Pypi,
    /// crates.io packages (.crate tarballs)
    Cratesio,
    /// Debian binary packages (.deb)
    Debian,
    /// Maven Central artifacts (jars)
    Maven,
}

impl Ecosystem {
    /// All ecosystems, in declaration order.
    pub const ALL: &'static [Ecosystem] = &[
        Ecosystem::Npm,
        Ecosystem::Pypi,
        Ecosystem::Cratesio,
        Ecosystem::Debian,
        Ecosystem::Maven,
    ];

    /// The lowercase name used on the wire and in asset paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            Ecosystem::Npm => "npm",
            Ecosystem::Pypi => "pypi",
            Ecosystem::Cratesio => "cratesio",
            Ecosystem::Debian => "debian",
            Ecosystem::Maven => "maven",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ecosystem {
    type Err = TargetError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "npm" => Ok(Ecosystem::Npm),
            "pypi" => Ok(Ecosystem::Pypi),
            "cratesio" => Ok(Ecosystem::Cratesio),
            "debian" => Ok(Ecosystem::Debian),
            "maven" => Ok(Ecosystem::Maven),
            other => Err(TargetError::UnknownEcosystem {
                ecosystem: other.to_owned(),
            }),
        }
    }
}

/// Errors produced when constructing or validating a [`Target`][].
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The ecosystem string wasn't one of the closed set
    #[error("unknown ecosystem: {ecosystem}")]
    UnknownEcosystem {
        /// the string we failed to parse
        ecosystem: String,
    },
    /// A required field of the target was empty
    #[error("target field must be non-empty: {field}")]
    EmptyField {
        /// the name of the offending field
        field: &'static str,
    },
}

/// The substitution applied to `/` in npm scoped package names when the name
/// becomes a filesystem/object-store path component.
///
/// The mapping is reversible: `!` never appears in legal npm package names.
pub const PACKAGE_SLASH_ENCODING: char = '!';

/// Identifies one published package artifact.
///
/// e.g. `(npm, @types/node, 20.1.0, types-node-20.1.0.tgz)`. Targets are
/// ephemeral request values; they are persisted only inside attestations and
/// attempt records.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Target {
    /// The registry the artifact was published to
    pub ecosystem: Ecosystem,
    /// Package name, in the registry's own spelling (npm scopes keep their `/`)
    pub package: String,
    /// Published version string
    pub version: String,
    /// Filename of the published artifact
    pub artifact: String,
}

impl Target {
    /// Construct a target, enforcing the non-empty invariants.
    pub fn new(
        ecosystem: Ecosystem,
        package: impl Into<String>,
        version: impl Into<String>,
        artifact: impl Into<String>,
    ) -> Result<Self, TargetError> {
        let target = Target {
            ecosystem,
            package: package.into(),
            version: version.into(),
            artifact: artifact.into(),
        };
        target.validate()?;
        Ok(target)
    }

    /// Check the non-empty invariants on all four fields.
    pub fn validate(&self) -> Result<(), TargetError> {
        if self.package.trim().is_empty() {
            return Err(TargetError::EmptyField { field: "package" });
        }
        if self.version.trim().is_empty() {
            return Err(TargetError::EmptyField { field: "version" });
        }
        if self.artifact.trim().is_empty() {
            return Err(TargetError::EmptyField { field: "artifact" });
        }
        Ok(())
    }

    /// The package name with the declared path encoding applied (`/` → `!`).
    ///
    /// Use this whenever the package name becomes a path component; the raw
    /// name stays on the wire everywhere else.
    pub fn encoded_package(&self) -> String {
        self.package.replace('/', &PACKAGE_SLASH_ENCODING.to_string())
    }

    /// Reverse [`Target::encoded_package`][].
    pub fn decode_package(encoded: &str) -> String {
        encoded.replace(PACKAGE_SLASH_ENCODING, "/")
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{} ({})",
            self.ecosystem, self.package, self.version, self.artifact
        )
    }
}

/// Where a package's source lives: a canonical HTTPS repo URL, a fully pinned
/// ref (commit hash or tag), and a subdirectory within the checkout.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Location {
    /// Canonical repository URL
    pub repo: String,
    /// Pinned git ref
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Directory within the checkout containing the package
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub dir: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ecosystem_roundtrip() {
        for eco in Ecosystem::ALL {
            let parsed: Ecosystem = eco.as_str().parse().unwrap();
            assert_eq!(parsed, *eco);
            let json = serde_json::to_string(eco).unwrap();
            assert_eq!(json, format!("\"{eco}\""));
        }
        assert!("rubygems".parse::<Ecosystem>().is_err());
    }

    #[test]
    fn scoped_package_encoding() {
        let target = Target::new(
            Ecosystem::Npm,
            "@types/node",
            "20.1.0",
            "types-node-20.1.0.tgz",
        )
        .unwrap();
        assert_eq!(target.encoded_package(), "@types!node");
        assert_eq!(Target::decode_package("@types!node"), "@types/node");
    }

    #[test]
    fn empty_fields_rejected() {
        assert!(Target::new(Ecosystem::Pypi, "", "1.0", "a.whl").is_err());
        assert!(Target::new(Ecosystem::Pypi, "absl-py", " ", "a.whl").is_err());
        assert!(Target::new(Ecosystem::Pypi, "absl-py", "1.0", "").is_err());
    }

    #[test]
    fn location_ref_field_name() {
        let loc = Location {
            repo: "https://github.com/abseil/abseil-py".to_owned(),
            git_ref: "a2f5acd".to_owned(),
            dir: String::new(),
        };
        let json = serde_json::to_value(&loc).unwrap();
        assert_eq!(json["ref"], "a2f5acd");
        assert!(json.get("dir").is_none());
    }
}
