//! Custom stabilizers declared in build definitions.
//!
//! Unlike the builtins these carry per-package configuration (glob sets,
//! regexes) and a human-readable `reason` recorded for audit. Identifiers are
//! generated from a zero-based counter at compile time and are stable across
//! re-serialization of the same definition; the counter itself never leaves
//! this module.

use globset::{Glob, GlobSet, GlobSetBuilder};
use rebuildr_schema::strategy::CustomStabilizerEntry;

use super::{TarEntry, ZipEntry};
use crate::errors::{RebuildError, RebuildResult};

/// What a custom stabilizer does to matching entries.
pub enum CustomAction {
    /// Regex-substitute inside the bodies of matching entries
    Replace {
        /// Byte regex to search for
        pattern: regex::bytes::Regex,
        /// Replacement bytes
        replacement: Vec<u8>,
    },
    /// Drop matching entries entirely
    Exclude,
}

/// A compiled custom stabilizer.
pub struct CustomStabilizer {
    /// Generated identifier (`custom-stabilizer-<n>`)
    pub name: String,
    /// Why this transform is sound for this package
    pub reason: String,
    paths: GlobSet,
    action: CustomAction,
}

fn compile_globs(paths: &[String]) -> RebuildResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for path in paths {
        builder.add(Glob::new(path)?);
    }
    Ok(builder.build()?)
}

/// Compile the entries of a build definition, assigning stable identifiers
/// in declaration order.
pub fn compile_custom_stabilizers(
    entries: &[CustomStabilizerEntry],
) -> RebuildResult<Vec<CustomStabilizer>> {
    let mut compiled = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let name = format!("custom-stabilizer-{index}");
        let stabilizer = match (&entry.replace_pattern, &entry.exclude_path) {
            (Some(replace), None) => CustomStabilizer {
                name,
                reason: entry.reason.clone(),
                paths: compile_globs(&replace.paths)?,
                action: CustomAction::Replace {
                    pattern: regex::bytes::Regex::new(&replace.pattern)?,
                    replacement: replace.replace.clone().into_bytes(),
                },
            },
            (None, Some(exclude)) => CustomStabilizer {
                name,
                reason: entry.reason.clone(),
                paths: compile_globs(&exclude.paths)?,
                action: CustomAction::Exclude,
            },
            _ => {
                return Err(RebuildError::invalid_argument(format!(
                    "custom stabilizer {index} must set exactly one of replace_pattern, exclude_path"
                )))
            }
        };
        compiled.push(stabilizer);
    }
    Ok(compiled)
}

impl CustomStabilizer {
    fn matches(&self, path: &str) -> bool {
        self.paths.is_match(path)
    }

    /// Apply to a tar entry list.
    pub fn apply_tar(&self, entries: &mut Vec<TarEntry>) -> RebuildResult<()> {
        match &self.action {
            CustomAction::Exclude => {
                entries.retain(|e| !self.matches(&e.path));
            }
            CustomAction::Replace {
                pattern,
                replacement,
            } => {
                for entry in entries.iter_mut() {
                    if self.matches(&entry.path) {
                        entry.data = pattern
                            .replace_all(&entry.data, replacement.as_slice())
                            .into_owned();
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply to a zip entry list.
    pub fn apply_zip(&self, entries: &mut Vec<ZipEntry>) -> RebuildResult<()> {
        match &self.action {
            CustomAction::Exclude => {
                entries.retain(|e| !self.matches(&e.name));
            }
            CustomAction::Replace {
                pattern,
                replacement,
            } => {
                for entry in entries.iter_mut() {
                    if self.matches(&entry.name) {
                        entry.data = pattern
                            .replace_all(&entry.data, replacement.as_slice())
                            .into_owned();
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rebuildr_schema::strategy::{ExcludePathConfig, ReplacePatternConfig};

    fn entry(path: &str, data: &[u8]) -> TarEntry {
        TarEntry {
            header: tar::Header::new_gnu(),
            path: path.to_owned(),
            link_target: None,
            pax: vec![],
            data: data.to_vec(),
        }
    }

    #[test]
    fn names_follow_declaration_order() {
        let compiled = compile_custom_stabilizers(&[
            CustomStabilizerEntry {
                replace_pattern: None,
                exclude_path: Some(ExcludePathConfig {
                    paths: vec!["*/.cargo_vcs_info.json".to_owned()],
                }),
                reason: "vcs info embeds the packaging checkout".to_owned(),
            },
            CustomStabilizerEntry {
                replace_pattern: Some(ReplacePatternConfig {
                    paths: vec!["package/version.py".to_owned()],
                    pattern: r"built-at: \d+".to_owned(),
                    replace: "built-at: 0".to_owned(),
                }),
                exclude_path: None,
                reason: "build timestamp embedded in version module".to_owned(),
            },
        ])
        .unwrap();
        assert_eq!(compiled[0].name, "custom-stabilizer-0");
        assert_eq!(compiled[1].name, "custom-stabilizer-1");
    }

    #[test]
    fn exactly_one_variant_required() {
        assert!(compile_custom_stabilizers(&[CustomStabilizerEntry {
            replace_pattern: None,
            exclude_path: None,
            reason: "nothing set".to_owned(),
        }])
        .is_err());
    }

    #[test]
    fn exclude_and_replace_apply() {
        let compiled = compile_custom_stabilizers(&[
            CustomStabilizerEntry {
                replace_pattern: None,
                exclude_path: Some(ExcludePathConfig {
                    paths: vec!["pkg/generated/*".to_owned()],
                }),
                reason: "generated files differ per build".to_owned(),
            },
            CustomStabilizerEntry {
                replace_pattern: Some(ReplacePatternConfig {
                    paths: vec!["pkg/version.txt".to_owned()],
                    pattern: r"\d{10}".to_owned(),
                    replace: "0".to_owned(),
                }),
                exclude_path: None,
                reason: "epoch stamp".to_owned(),
            },
        ])
        .unwrap();

        let mut entries = vec![
            entry("pkg/generated/index.js", b"noise"),
            entry("pkg/version.txt", b"stamp 1700000000 end"),
            entry("pkg/lib.js", b"code"),
        ];
        for stabilizer in &compiled {
            stabilizer.apply_tar(&mut entries).unwrap();
        }
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["pkg/version.txt", "pkg/lib.js"]);
        assert_eq!(entries[0].data, b"stamp 0 end");
    }
}
