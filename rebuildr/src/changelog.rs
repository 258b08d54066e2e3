//! The embedded service changelog and pseudo-version validation.
//!
//! Overwrite arbitration in `service-update` mode needs to know whether the
//! signing service changed in a way that affects attestation content between
//! two versions. The changelog is compiled in: a short list of
//! `(version, reason)` pairs, flagged when the change is attestation
//! impacting, compared lexicographically. Version format is validated at
//! startup, never at compare time.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{RebuildError, RebuildResult};

/// One changelog entry.
#[derive(Debug, Clone, Copy)]
pub struct ChangelogEntry {
    /// The service version that shipped the change
    pub version: &'static str,
    /// What changed
    pub reason: &'static str,
    /// Whether attestations produced before this version differ from ones
    /// produced after
    pub impacts_attestations: bool,
}

/// The service changelog, ascending by version.
pub const CHANGELOG: &[ChangelogEntry] = &[
    ChangelogEntry {
        version: "v0.1.0",
        reason: "initial attestation format",
        impacts_attestations: true,
    },
    ChangelogEntry {
        version: "v0.2.0",
        reason: "record dockerfile digest in rebuild attestations",
        impacts_attestations: true,
    },
    ChangelogEntry {
        version: "v0.2.4",
        reason: "gateway token bucket tuning",
        impacts_attestations: false,
    },
    ChangelogEntry {
        version: "v0.3.0",
        reason: "record applied stabilizer set in equivalence attestations",
        impacts_attestations: true,
    },
    ChangelogEntry {
        version: "v0.3.1",
        reason: "attempt records carry build timings",
        impacts_attestations: false,
    },
];

// vX.Y.Z with an optional pseudo-version suffix; no empty segments, no
// scheme prefixes.
static PSEUDO_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v[0-9]+\.[0-9]+\.[0-9]+(-[0-9A-Za-z]+(\.[0-9A-Za-z]+)*)*$")
        .expect("pseudo-version regex is valid")
});

/// Validate a `vX.Y.Z`-style service pseudo-version.
pub fn validate_pseudo_version(version: &str) -> RebuildResult<()> {
    if !PSEUDO_VERSION.is_match(version) {
        return Err(RebuildError::invalid_argument(format!(
            "malformed service version: {version:?}"
        )));
    }
    // the regex bounds the shape; semver rejects leading zeros and other
    // numeric nonsense in the base triple
    semver::Version::parse(&version[1..]).map_err(|err| {
        RebuildError::invalid_argument(format!("malformed service version {version:?}: {err}"))
    })?;
    Ok(())
}

/// Whether overwriting a bundle attested by `previous` is justified at
/// `current`: true iff some attestation-impacting entry lies in
/// `(previous, current]`, comparing pseudo-versions lexicographically.
pub fn overwrite_eligible(previous: &str, current: &str) -> bool {
    CHANGELOG.iter().any(|entry| {
        entry.impacts_attestations && previous < entry.version && entry.version <= current
    })
}
