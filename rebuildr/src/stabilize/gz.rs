//! Gzip header handling and canonical recompression.

use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::io::{Read, Write};

use super::{PassFn, Stabilizer};
use crate::errors::{RebuildError, RebuildResult};

// One fixed level so recompression is deterministic on both sides of a
// comparison.
const CANONICAL_GZIP_LEVEL: u32 = 6;

/// The mutable gzip header fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GzipMeta {
    /// Header modification time (seconds since epoch)
    pub mtime: u32,
    /// Original filename field
    pub filename: Option<Vec<u8>>,
    /// Comment field
    pub comment: Option<Vec<u8>>,
    /// Extra field
    pub extra: Option<Vec<u8>>,
}

pub(super) fn decode(input: &[u8]) -> RebuildResult<(GzipMeta, Vec<u8>)> {
    let mut decoder = GzDecoder::new(input);
    let mut inner = Vec::new();
    decoder.read_to_end(&mut inner)?;
    // the header is only guaranteed parsed once the stream has been read
    let meta = match decoder.header() {
        Some(header) => GzipMeta {
            mtime: header.mtime(),
            filename: header.filename().map(|b| b.to_vec()),
            comment: header.comment().map(|b| b.to_vec()),
            extra: header.extra().map(|b| b.to_vec()),
        },
        None => return Err(RebuildError::invalid_argument("not a gzip stream")),
    };
    Ok((meta, inner))
}

pub(super) fn encode(meta: &GzipMeta, inner: &[u8]) -> RebuildResult<Vec<u8>> {
    let mut builder = GzBuilder::new().mtime(meta.mtime);
    if let Some(filename) = &meta.filename {
        builder = builder.filename(filename.clone());
    }
    if let Some(comment) = &meta.comment {
        builder = builder.comment(comment.clone());
    }
    if let Some(extra) = &meta.extra {
        builder = builder.extra(extra.clone());
    }
    let mut encoder = builder.write(Vec::new(), Compression::new(CANONICAL_GZIP_LEVEL));
    encoder.write_all(inner)?;
    Ok(encoder.finish()?)
}

pub(super) fn apply_passes(mut meta: GzipMeta, passes: &[&Stabilizer]) -> GzipMeta {
    for stabilizer in passes {
        if let PassFn::Gzip(f) = stabilizer.pass {
            f(&mut meta);
        }
    }
    meta
}

pub(super) fn canonical_header(meta: &mut GzipMeta) {
    meta.mtime = 0;
    meta.filename = None;
    meta.comment = None;
    meta.extra = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stabilize::{default_stabilizers, stabilize, ArchiveFormat};

    fn noisy_gzip(payload: &[u8]) -> Vec<u8> {
        let mut encoder = GzBuilder::new()
            .mtime(1_700_000_000)
            .filename("payload.tar".as_bytes().to_vec())
            .write(Vec::new(), Compression::new(9));
        encoder.write_all(payload).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn header_noise_removed() {
        let stabilized = stabilize(
            &noisy_gzip(b"payload"),
            ArchiveFormat::Gzip,
            &default_stabilizers(None),
            &[],
        )
        .unwrap();
        let (meta, inner) = decode(&stabilized).unwrap();
        assert_eq!(meta, GzipMeta::default());
        assert_eq!(inner, b"payload");
    }

    #[test]
    fn different_compression_levels_converge() {
        let mut encoder = GzBuilder::new().write(Vec::new(), Compression::new(1));
        encoder.write_all(b"payload payload payload").unwrap();
        let fast = encoder.finish().unwrap();
        let best = {
            let mut encoder = GzBuilder::new().write(Vec::new(), Compression::new(9));
            encoder.write_all(b"payload payload payload").unwrap();
            encoder.finish().unwrap()
        };
        assert_ne!(fast, best);

        let passes = default_stabilizers(None);
        let a = stabilize(&fast, ArchiveFormat::Gzip, &passes, &[]).unwrap();
        let b = stabilize(&best, ArchiveFormat::Gzip, &passes, &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn gzip_stabilization_is_idempotent() {
        let passes = default_stabilizers(None);
        let once = stabilize(&noisy_gzip(b"abc"), ArchiveFormat::Gzip, &passes, &[]).unwrap();
        let twice = stabilize(&once, ArchiveFormat::Gzip, &passes, &[]).unwrap();
        assert_eq!(once, twice);
    }
}
