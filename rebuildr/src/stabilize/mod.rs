//! Content-preserving archive canonicalization.
//!
//! Rebuilds rarely match upstream bit-for-bit: archives carry timestamps,
//! ordering, ownership, and compression tunables that say nothing about the
//! contents. The stabilizer engine rewrites an archive into a canonical form
//! that preserves file contents and semantic structure, so the verifier can
//! compare digests of the canonical streams instead.
//!
//! Canonicalization is by re-emission: archives are parsed into an in-memory
//! entry model, the selected passes mutate that model in declared order (one
//! application per pass), and a fresh archive is written with fixed writer
//! settings. Re-emission itself drops the bytes the entry model does not
//! carry (zip data descriptors; recompression at a fixed level), which is
//! sound because both sides of a comparison pass through the same writer;
//! everything the model does carry is governed by a named, selectable pass.

use rebuildr_schema::Ecosystem;
use sha2::Digest as _;
use std::collections::BTreeMap;

use crate::errors::{RebuildError, RebuildResult};

mod custom;
mod gz;
mod tarball;
mod zipfile;

pub use custom::{compile_custom_stabilizers, CustomAction, CustomStabilizer};
pub use gz::GzipMeta;
pub use tarball::TarEntry;
pub use zipfile::ZipEntry;

/// Archive container formats the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// Uncompressed tar
    Tar,
    /// Gzip-compressed tar (npm tgz, crates .crate, sdists)
    TarGz,
    /// Zip (wheels, jars, eggs)
    Zip,
    /// Bare gzip member
    Gzip,
    /// Anything we compare byte-for-byte only (e.g. .deb)
    Raw,
}

/// Pick the format for an artifact filename, with a small ecosystem override
/// for extensionless or ecosystem-conventional names.
pub fn detect_format(filename: &str, ecosystem: Option<Ecosystem>) -> ArchiveFormat {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".whl") || lower.ends_with(".jar") || lower.ends_with(".zip")
        || lower.ends_with(".egg")
    {
        return ArchiveFormat::Zip;
    }
    if lower.ends_with(".tgz") || lower.ends_with(".tar.gz") || lower.ends_with(".crate") {
        return ArchiveFormat::TarGz;
    }
    if lower.ends_with(".tar") {
        return ArchiveFormat::Tar;
    }
    if lower.ends_with(".gz") {
        return ArchiveFormat::Gzip;
    }
    match ecosystem {
        Some(Ecosystem::Npm) | Some(Ecosystem::Cratesio) => ArchiveFormat::TarGz,
        Some(Ecosystem::Maven) => ArchiveFormat::Zip,
        _ => ArchiveFormat::Raw,
    }
}

/// The transform a stabilizer performs, keyed by the archive surface it
/// touches. Archive-wide passes see the whole entry list; entry passes are
/// applied to each entry in turn.
#[derive(Clone, Copy)]
pub enum PassFn {
    /// Whole-archive tar transform
    TarArchive(fn(&mut Vec<TarEntry>)),
    /// Per-entry tar transform
    TarEntry(fn(&mut TarEntry)),
    /// Whole-archive zip transform
    ZipArchive(fn(&mut Vec<ZipEntry>)),
    /// Per-entry zip transform
    ZipEntry(fn(&mut ZipEntry)),
    /// Gzip header transform
    Gzip(fn(&mut GzipMeta)),
}

/// A named, in-place, content-preserving transform.
pub struct Stabilizer {
    /// Stable identifier used in CLI selectors and attestations
    pub name: &'static str,
    /// The transform itself
    pub pass: PassFn,
}

/// Every builtin stabilizer, in default application order.
///
/// The order is part of the attestation contract: bundles record the applied
/// set in this order, so append new passes rather than reordering.
pub static ALL_STABILIZERS: &[Stabilizer] = &[
    Stabilizer { name: "tar-sort-entries", pass: PassFn::TarArchive(tarball::sort_entries) },
    Stabilizer { name: "tar-zero-timestamps", pass: PassFn::TarArchive(tarball::zero_timestamps) },
    Stabilizer { name: "tar-normalize-owners", pass: PassFn::TarArchive(tarball::normalize_owners) },
    Stabilizer { name: "tar-drop-pax-headers", pass: PassFn::TarArchive(tarball::drop_pax_headers) },
    Stabilizer { name: "tar-entry-strip-atime-ctime", pass: PassFn::TarEntry(tarball::strip_atime_ctime) },
    Stabilizer { name: "tar-entry-canonical-links", pass: PassFn::TarEntry(tarball::canonicalize_links) },
    Stabilizer { name: "tar-entry-normalize-mode", pass: PassFn::TarEntry(tarball::normalize_mode) },
    Stabilizer { name: "zip-sort-entries", pass: PassFn::ZipArchive(zipfile::sort_entries) },
    Stabilizer { name: "zip-normalize-version-made-by", pass: PassFn::ZipArchive(zipfile::normalize_version_made_by) },
    Stabilizer { name: "zip-entry-zero-mtime", pass: PassFn::ZipEntry(zipfile::zero_mtime) },
    Stabilizer { name: "zip-entry-normalize-attrs", pass: PassFn::ZipEntry(zipfile::normalize_attrs) },
    Stabilizer { name: "zip-entry-strip-extra", pass: PassFn::ZipEntry(zipfile::strip_extra) },
    Stabilizer { name: "gzip-canonical-header", pass: PassFn::Gzip(gz::canonical_header) },
    Stabilizer { name: "jar-git-properties", pass: PassFn::ZipArchive(zipfile::canonicalize_git_properties) },
    Stabilizer { name: "wheel-record", pass: PassFn::ZipArchive(zipfile::reemit_wheel_record) },
];

/// Names of ecosystem-specific passes and the ecosystem they default on for.
const ECOSYSTEM_PASSES: &[(&str, Ecosystem)] = &[
    ("jar-git-properties", Ecosystem::Maven),
    ("wheel-record", Ecosystem::Pypi),
];

/// Look up a builtin stabilizer by name.
pub fn stabilizer_by_name(name: &str) -> Option<&'static Stabilizer> {
    ALL_STABILIZERS.iter().find(|s| s.name == name)
}

/// All builtin names in default order, for `--help` and diagnostics.
pub fn all_stabilizer_names() -> Vec<&'static str> {
    ALL_STABILIZERS.iter().map(|s| s.name).collect()
}

/// The default pass list for an ecosystem: every generic pass plus the
/// ecosystem's own extras.
pub fn default_stabilizers(ecosystem: Option<Ecosystem>) -> Vec<&'static Stabilizer> {
    ALL_STABILIZERS
        .iter()
        .filter(|s| {
            match ECOSYSTEM_PASSES.iter().find(|(name, _)| *name == s.name) {
                Some((_, eco)) => ecosystem == Some(*eco),
                None => true,
            }
        })
        .collect()
}

/// An enable-list selector: everything, or an explicit name list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnableSelection {
    /// Select the full default set
    All,
    /// Select exactly these names, in this order (duplicates preserved)
    List(Vec<String>),
}

/// A disable-list selector: nothing, or an explicit name list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisableSelection {
    /// Disable nothing
    None,
    /// Remove these names from the selection
    List(Vec<String>),
}

/// Which passes to run. Disable wins over enable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSelection {
    /// The enable list (or "all")
    pub enable: EnableSelection,
    /// The disable list (or "none")
    pub disable: DisableSelection,
}

impl Default for PassSelection {
    fn default() -> Self {
        PassSelection {
            enable: EnableSelection::All,
            disable: DisableSelection::None,
        }
    }
}

impl PassSelection {
    /// Parse the CLI selector pair (`csv|all`, `csv|none`).
    pub fn parse(enable: &str, disable: &str) -> Self {
        let enable = match enable.trim() {
            "" | "all" => EnableSelection::All,
            csv => EnableSelection::List(
                csv.split(',').map(|s| s.trim().to_owned()).collect(),
            ),
        };
        let disable = match disable.trim() {
            "" | "none" => DisableSelection::None,
            csv => DisableSelection::List(
                csv.split(',').map(|s| s.trim().to_owned()).collect(),
            ),
        };
        PassSelection { enable, disable }
    }

    /// Resolve to a concrete pass list for an ecosystem.
    pub fn resolve(
        &self,
        ecosystem: Option<Ecosystem>,
    ) -> RebuildResult<Vec<&'static Stabilizer>> {
        let mut selected = match &self.enable {
            EnableSelection::All => default_stabilizers(ecosystem),
            EnableSelection::List(names) => {
                let mut list = Vec::with_capacity(names.len());
                for name in names {
                    let stabilizer = stabilizer_by_name(name).ok_or_else(|| {
                        RebuildError::invalid_argument(format!("unknown stabilizer: {name}"))
                    })?;
                    list.push(stabilizer);
                }
                list
            }
        };
        if let DisableSelection::List(names) = &self.disable {
            for name in names {
                if stabilizer_by_name(name).is_none() {
                    return Err(RebuildError::invalid_argument(format!(
                        "unknown stabilizer: {name}"
                    )));
                }
            }
            selected.retain(|s| !names.iter().any(|n| n == s.name));
        }
        Ok(selected)
    }
}

/// Rewrite `input` into canonical form under the given passes.
///
/// `Raw` inputs pass through untouched; unknown containers are a caller bug
/// caught by format detection, not here.
pub fn stabilize(
    input: &[u8],
    format: ArchiveFormat,
    passes: &[&Stabilizer],
    custom: &[CustomStabilizer],
) -> RebuildResult<Vec<u8>> {
    match format {
        ArchiveFormat::Raw => Ok(input.to_vec()),
        ArchiveFormat::Tar => tarball::stabilize_tar(input, passes, custom),
        ArchiveFormat::TarGz => {
            let (meta, inner) = gz::decode(input)?;
            let stabilized = tarball::stabilize_tar(&inner, passes, custom)?;
            let meta = gz::apply_passes(meta, passes);
            gz::encode(&meta, &stabilized)
        }
        ArchiveFormat::Gzip => {
            let (meta, inner) = gz::decode(input)?;
            let meta = gz::apply_passes(meta, passes);
            gz::encode(&meta, &inner)
        }
        ArchiveFormat::Zip => zipfile::stabilize_zip(input, passes, custom),
    }
}

/// One computed digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashDigest {
    /// Algorithm name (sha256, sha512)
    pub algorithm: &'static str,
    /// Lowercase hex digest
    pub hex: String,
}

/// The digest algorithms declared for an ecosystem's artifacts.
pub fn hash_algorithms(ecosystem: Ecosystem) -> &'static [&'static str] {
    match ecosystem {
        Ecosystem::Npm => &["sha256", "sha512"],
        _ => &["sha256"],
    }
}

fn digest_bytes(algorithm: &'static str, bytes: &[u8]) -> HashDigest {
    let hex = match algorithm {
        "sha512" => hex::encode(sha2::Sha512::digest(bytes)),
        _ => hex::encode(sha2::Sha256::digest(bytes)),
    };
    HashDigest { algorithm, hex }
}

/// Digest summary of one artifact: raw bytes and stabilized bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    /// Where the bytes came from
    pub uri: String,
    /// Digests over the bytes on the wire
    pub digests: Vec<HashDigest>,
    /// Digests over the stabilized stream
    pub stabilized_digests: Vec<HashDigest>,
    /// Names of the passes that produced the stabilized stream
    pub stabilizers: Vec<String>,
}

impl ArtifactSummary {
    /// Raw digests as an algorithm→hex map (attestation subject form).
    pub fn digest_map(&self) -> BTreeMap<String, String> {
        self.digests
            .iter()
            .map(|d| (d.algorithm.to_owned(), d.hex.clone()))
            .collect()
    }

    /// Stabilized digests as an algorithm→hex map.
    pub fn stabilized_digest_map(&self) -> BTreeMap<String, String> {
        self.stabilized_digests
            .iter()
            .map(|d| (d.algorithm.to_owned(), d.hex.clone()))
            .collect()
    }
}

/// Compute both digest variants for an artifact in a single pass each.
pub fn summarize_bytes(
    uri: &str,
    bytes: &[u8],
    ecosystem: Ecosystem,
    artifact: &str,
    passes: &[&Stabilizer],
    custom: &[CustomStabilizer],
) -> RebuildResult<ArtifactSummary> {
    let format = detect_format(artifact, Some(ecosystem));
    let stabilized = stabilize(bytes, format, passes, custom)?;
    let algorithms = hash_algorithms(ecosystem);
    let mut names: Vec<String> = passes.iter().map(|p| p.name.to_owned()).collect();
    names.extend(custom.iter().map(|c| c.name.clone()));
    Ok(ArtifactSummary {
        uri: uri.to_owned(),
        digests: algorithms.iter().map(|a| digest_bytes(a, bytes)).collect(),
        stabilized_digests: algorithms
            .iter()
            .map(|a| digest_bytes(a, &stabilized))
            .collect(),
        stabilizers: names,
    })
}
