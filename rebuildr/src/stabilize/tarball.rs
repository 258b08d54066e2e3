//! Tar parsing, passes, and canonical re-emission.

use std::io::Read;

use super::{CustomStabilizer, PassFn, Stabilizer};
use crate::errors::RebuildResult;

/// One parsed tar entry: the header as read, the pax/longname-resolved path,
/// and the entry body.
pub struct TarEntry {
    /// Header as read from the wire (mutated by passes)
    pub header: tar::Header,
    /// Entry path
    pub path: String,
    /// Link target for symlinks and hard links
    pub link_target: Option<String>,
    /// PAX extended records attached to this entry
    pub pax: Vec<(String, Vec<u8>)>,
    /// Entry body (empty for directories and links)
    pub data: Vec<u8>,
}

pub(super) fn parse_tar(input: &[u8]) -> RebuildResult<Vec<TarEntry>> {
    let mut archive = tar::Archive::new(input);
    let mut entries = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
        let link_target = entry
            .link_name_bytes()
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let mut pax = Vec::new();
        if let Some(extensions) = entry.pax_extensions()? {
            for extension in extensions {
                let extension = extension?;
                if let Ok(key) = extension.key() {
                    pax.push((key.to_owned(), extension.value_bytes().to_vec()));
                }
            }
        }
        let header = entry.header().clone();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        entries.push(TarEntry {
            header,
            path,
            link_target,
            pax,
            data,
        });
    }
    Ok(entries)
}

fn write_tar(entries: &[TarEntry]) -> RebuildResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for entry in entries {
        if !entry.pax.is_empty() {
            append_pax_records(&mut builder, &entry.path, &entry.pax)?;
        }
        let mut header = entry.header.clone();
        if let Some(target) = &entry.link_target {
            builder.append_link(&mut header, &entry.path, target)?;
        } else {
            builder.append_data(&mut header, &entry.path, entry.data.as_slice())?;
        }
    }
    Ok(builder.into_inner()?)
}

// PAX record framing: "<len> <key>=<value>\n" where len counts the whole
// record including the length digits themselves.
fn pax_record(key: &str, value: &[u8]) -> Vec<u8> {
    let base = key.len() + value.len() + 3;
    let mut len = base + 1;
    while len != base + len.to_string().len() {
        len = base + len.to_string().len();
    }
    let mut record = format!("{len} {key}=").into_bytes();
    record.extend_from_slice(value);
    record.push(b'\n');
    record
}

fn append_pax_records(
    builder: &mut tar::Builder<Vec<u8>>,
    entry_path: &str,
    records: &[(String, Vec<u8>)],
) -> RebuildResult<()> {
    let mut body = Vec::new();
    for (key, value) in records {
        body.extend_from_slice(&pax_record(key, value));
    }
    let mut header = tar::Header::new_ustar();
    header.set_entry_type(tar::EntryType::XHeader);
    header.set_mode(0o644);
    let name = format!("PaxHeaders.0/{entry_path}");
    builder.append_data(&mut header, name, body.as_slice())?;
    Ok(())
}

/// Apply the selected passes and re-emit.
pub(super) fn stabilize_tar(
    input: &[u8],
    passes: &[&Stabilizer],
    custom: &[CustomStabilizer],
) -> RebuildResult<Vec<u8>> {
    let mut entries = parse_tar(input)?;
    for stabilizer in passes {
        match stabilizer.pass {
            PassFn::TarArchive(f) => f(&mut entries),
            PassFn::TarEntry(f) => {
                for entry in entries.iter_mut() {
                    f(entry);
                }
            }
            _ => {}
        }
    }
    for stabilizer in custom {
        stabilizer.apply_tar(&mut entries)?;
    }
    write_tar(&entries)
}

pub(super) fn sort_entries(entries: &mut Vec<TarEntry>) {
    entries.sort_by(|a, b| a.path.cmp(&b.path));
}

pub(super) fn zero_timestamps(entries: &mut Vec<TarEntry>) {
    for entry in entries.iter_mut() {
        entry.header.set_mtime(0);
        entry.pax.retain(|(key, _)| key != "mtime");
    }
}

pub(super) fn normalize_owners(entries: &mut Vec<TarEntry>) {
    for entry in entries.iter_mut() {
        entry.header.set_uid(0);
        entry.header.set_gid(0);
        // old-style headers have no user name fields to clear
        let _ = entry.header.set_username("");
        let _ = entry.header.set_groupname("");
        entry
            .pax
            .retain(|(key, _)| key != "uid" && key != "gid" && key != "uname" && key != "gname");
    }
}

pub(super) fn drop_pax_headers(entries: &mut Vec<TarEntry>) {
    for entry in entries.iter_mut() {
        entry.pax.clear();
    }
}

pub(super) fn strip_atime_ctime(entry: &mut TarEntry) {
    if let Some(gnu) = entry.header.as_gnu_mut() {
        gnu.set_atime(0);
        gnu.set_ctime(0);
    }
    entry
        .pax
        .retain(|(key, _)| key != "atime" && key != "ctime");
}

pub(super) fn canonicalize_links(entry: &mut TarEntry) {
    if let Some(stripped) = entry.path.strip_prefix("./") {
        if !stripped.is_empty() {
            entry.path = stripped.to_owned();
        }
    }
    if let Some(target) = &entry.link_target {
        if let Some(stripped) = target.strip_prefix("./") {
            if !stripped.is_empty() {
                entry.link_target = Some(stripped.to_owned());
            }
        }
    }
}

pub(super) fn normalize_mode(entry: &mut TarEntry) {
    let kind = entry.header.entry_type();
    let mode = entry.header.mode().unwrap_or(0o644);
    let normalized = if kind.is_dir() {
        0o755
    } else if kind.is_symlink() {
        0o777
    } else if mode & 0o111 != 0 {
        0o755
    } else {
        0o644
    };
    entry.header.set_mode(normalized);
}
