//! Zip parsing, passes, and canonical re-emission.
//!
//! The writer re-deflates every entry at one fixed level and emits a fresh
//! central directory, so data descriptors never survive a rewrite. Everything
//! else lives in the entry model and is governed by the named passes: order,
//! times, unix attributes (which also determine the emitted version-made-by),
//! and extra fields (which the canonical writer never re-emits; the strip
//! pass makes that canonicalization explicit and selectable).

use base64::Engine;
use sha2::Digest as _;
use std::io::{Cursor, Read, Write};

use super::{CustomStabilizer, PassFn, Stabilizer};
use crate::errors::RebuildResult;

/// One parsed zip entry.
pub struct ZipEntry {
    /// Entry name (forward-slash path)
    pub name: String,
    /// Modification time; `None` means the DOS epoch
    pub mtime: Option<zip::DateTime>,
    /// Unix permissions from the external attributes, if present
    pub unix_mode: Option<u32>,
    /// Whether this is a directory entry
    pub is_dir: bool,
    /// Extra field bytes as read from the local header
    pub extra: Vec<u8>,
    /// Decompressed entry body
    pub data: Vec<u8>,
}

pub(super) fn parse_zip(input: &[u8]) -> RebuildResult<Vec<ZipEntry>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(input))?;
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        entries.push(ZipEntry {
            name: file.name().to_owned(),
            mtime: Some(file.last_modified()),
            unix_mode: file.unix_mode(),
            is_dir: file.is_dir(),
            extra: file.extra_data().to_vec(),
            data,
        });
    }
    Ok(entries)
}

fn write_zip(entries: &[ZipEntry]) -> RebuildResult<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for entry in entries {
        let mut options = zip::write::FileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .last_modified_time(entry.mtime.unwrap_or_default());
        if let Some(mode) = entry.unix_mode {
            options = options.unix_permissions(mode);
        }
        if entry.is_dir {
            writer.add_directory(entry.name.clone(), options)?;
        } else {
            writer.start_file(entry.name.clone(), options)?;
            writer.write_all(&entry.data)?;
        }
    }
    Ok(writer.finish()?.into_inner())
}

/// Apply the selected passes and re-emit.
pub(super) fn stabilize_zip(
    input: &[u8],
    passes: &[&Stabilizer],
    custom: &[CustomStabilizer],
) -> RebuildResult<Vec<u8>> {
    let mut entries = parse_zip(input)?;
    for stabilizer in passes {
        match stabilizer.pass {
            PassFn::ZipArchive(f) => f(&mut entries),
            PassFn::ZipEntry(f) => {
                for entry in entries.iter_mut() {
                    f(entry);
                }
            }
            _ => {}
        }
    }
    for stabilizer in custom {
        stabilizer.apply_zip(&mut entries)?;
    }
    write_zip(&entries)
}

pub(super) fn sort_entries(entries: &mut Vec<ZipEntry>) {
    entries.sort_by(|a, b| a.name.cmp(&b.name));
}

// The writer derives version-made-by and external attributes from the unix
// permissions; forcing them present keeps those bytes independent of the
// tool that produced the input archive.
pub(super) fn normalize_version_made_by(entries: &mut Vec<ZipEntry>) {
    for entry in entries.iter_mut() {
        if entry.unix_mode.is_none() {
            entry.unix_mode = Some(if entry.is_dir { 0o755 } else { 0o644 });
        }
    }
}

pub(super) fn zero_mtime(entry: &mut ZipEntry) {
    entry.mtime = None;
}

pub(super) fn normalize_attrs(entry: &mut ZipEntry) {
    let executable = entry.unix_mode.is_some_and(|m| m & 0o111 != 0);
    entry.unix_mode = Some(if entry.is_dir || executable { 0o755 } else { 0o644 });
}

pub(super) fn strip_extra(entry: &mut ZipEntry) {
    entry.extra.clear();
}

/// Keys in `git.properties` that depend on where/when the jar was built
/// rather than on the commit being built.
const VOLATILE_GIT_PROPERTY_PREFIXES: &[&str] = &["git.build."];

pub(super) fn canonicalize_git_properties(entries: &mut Vec<ZipEntry>) {
    for entry in entries.iter_mut() {
        if !entry.name.ends_with("git.properties") || entry.is_dir {
            continue;
        }
        let text = String::from_utf8_lossy(&entry.data);
        let mut lines: Vec<&str> = text
            .lines()
            .filter(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return false;
                }
                !VOLATILE_GIT_PROPERTY_PREFIXES
                    .iter()
                    .any(|prefix| line.starts_with(prefix))
            })
            .collect();
        lines.sort_unstable();
        let mut canonical = lines.join("\n");
        canonical.push('\n');
        entry.data = canonical.into_bytes();
    }
}

pub(super) fn reemit_wheel_record(entries: &mut Vec<ZipEntry>) {
    let Some(record_index) = entries
        .iter()
        .position(|e| e.name.ends_with(".dist-info/RECORD") && !e.is_dir)
    else {
        return;
    };
    let record_name = entries[record_index].name.clone();
    let mut record = String::new();
    for entry in entries.iter() {
        if entry.is_dir || entry.name == record_name {
            continue;
        }
        let digest = sha2::Sha256::digest(&entry.data);
        let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest);
        record.push_str(&format!(
            "{},sha256={},{}\n",
            entry.name,
            encoded,
            entry.data.len()
        ));
    }
    record.push_str(&format!("{record_name},,\n"));
    entries[record_index].data = record.into_bytes();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stabilize::{default_stabilizers, stabilize, ArchiveFormat};
    use rebuildr_schema::Ecosystem;

    fn build_zip(files: &[(&str, &[u8], Option<zip::DateTime>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data, mtime) in files {
            let mut options = zip::write::FileOptions::default()
                .compression_method(zip::CompressionMethod::Deflated);
            if let Some(mtime) = mtime {
                options = options.last_modified_time(*mtime);
            }
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn noisy_time() -> zip::DateTime {
        zip::DateTime::from_date_and_time(2023, 11, 2, 3, 4, 6).unwrap()
    }

    #[test]
    fn zip_ordering_differences_stabilize_away() {
        let a = build_zip(&[
            ("absl/__init__.py", b"", Some(noisy_time())),
            ("absl/app.py", b"import sys\n", Some(noisy_time())),
        ]);
        let b = build_zip(&[
            ("absl/app.py", b"import sys\n", None),
            ("absl/__init__.py", b"", None),
        ]);
        assert_ne!(a, b);

        let passes = default_stabilizers(Some(Ecosystem::Pypi));
        let sa = stabilize(&a, ArchiveFormat::Zip, &passes, &[]).unwrap();
        let sb = stabilize(&b, ArchiveFormat::Zip, &passes, &[]).unwrap();
        assert_eq!(sa, sb);
    }

    #[test]
    fn zip_stabilization_is_idempotent() {
        let archive = build_zip(&[("a.txt", b"a", Some(noisy_time())), ("b.txt", b"b", None)]);
        let passes = default_stabilizers(None);
        let once = stabilize(&archive, ArchiveFormat::Zip, &passes, &[]).unwrap();
        let twice = stabilize(&once, ArchiveFormat::Zip, &passes, &[]).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn wheel_record_is_recomputed() {
        let archive = build_zip(&[
            ("absl/app.py", b"import sys\n", None),
            (
                "absl_py-2.0.0.dist-info/RECORD",
                b"absl/app.py,sha256=stale,999\n",
                None,
            ),
        ]);
        let mut entries = parse_zip(&archive).unwrap();
        reemit_wheel_record(&mut entries);
        let record = String::from_utf8(entries[1].data.clone()).unwrap();
        assert!(record.contains("absl/app.py,sha256="));
        assert!(!record.contains("stale"));
        assert!(record.ends_with("absl_py-2.0.0.dist-info/RECORD,,\n"));
        assert!(record.contains(",11\n"));
    }

    #[test]
    fn git_properties_loses_build_noise() {
        let properties =
            b"#Generated\ngit.build.time=2023-11-02T03\ngit.commit.id=abc123\ngit.branch=main\n";
        let archive = build_zip(&[("META-INF/git.properties", properties, None)]);
        let mut entries = parse_zip(&archive).unwrap();
        canonicalize_git_properties(&mut entries);
        assert_eq!(
            entries[0].data,
            b"git.branch=main\ngit.commit.id=abc123\n".to_vec()
        );
    }

    #[test]
    fn attrs_normalized() {
        let mut entry = ZipEntry {
            name: "bin/tool".to_owned(),
            mtime: Some(noisy_time()),
            unix_mode: Some(0o700),
            is_dir: false,
            extra: vec![],
            data: vec![],
        };
        normalize_attrs(&mut entry);
        assert_eq!(entry.unix_mode, Some(0o755));
        zero_mtime(&mut entry);
        assert!(entry.mtime.is_none());
    }

    #[test]
    fn version_made_by_presence_is_normalized() {
        let mut entries = vec![
            ZipEntry {
                name: "absl/app.py".to_owned(),
                mtime: None,
                unix_mode: None,
                is_dir: false,
                extra: vec![],
                data: vec![],
            },
            ZipEntry {
                name: "bin/tool".to_owned(),
                mtime: None,
                unix_mode: Some(0o700),
                is_dir: false,
                extra: vec![],
                data: vec![],
            },
        ];
        normalize_version_made_by(&mut entries);
        assert_eq!(entries[0].unix_mode, Some(0o644));
        // existing attributes are left for the attrs pass to canonicalize
        assert_eq!(entries[1].unix_mode, Some(0o700));
    }

    #[test]
    fn extra_fields_stripped() {
        let mut entry = ZipEntry {
            name: "absl/app.py".to_owned(),
            mtime: None,
            unix_mode: None,
            is_dir: false,
            extra: vec![0x55, 0x54, 0x05, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00],
            data: vec![],
        };
        strip_extra(&mut entry);
        assert!(entry.extra.is_empty());
    }
}
