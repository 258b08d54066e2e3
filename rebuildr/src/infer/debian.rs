//! Debian heuristic.
//!
//! Debian source packages are rebuilt from the archive's own .dsc and
//! tarballs rather than from a git forge, so no clone happens here; the
//! location records the pool area the sources come from.

use rebuildr_schema::strategy::{DebianPackage, FileWithChecksum, Strategy};
use rebuildr_schema::{Location, Target};

use crate::errors::RebuildResult;
use crate::registry::RegistryMux;

fn file(source: &crate::registry::SourceFile) -> FileWithChecksum {
    FileWithChecksum {
        url: source.url.clone(),
        checksum: source.checksum.clone(),
    }
}

pub(super) async fn infer(
    target: &Target,
    registry: &dyn RegistryMux,
) -> RebuildResult<Strategy> {
    let meta = registry
        .debian_source(&target.package, &target.version)
        .await?;
    Ok(Strategy::DebianPackage(DebianPackage {
        location: Location {
            repo: meta.dsc.url.clone(),
            git_ref: target.version.clone(),
            dir: String::new(),
        },
        component: meta.component.clone(),
        dsc: Some(file(&meta.dsc)),
        orig: meta.orig.as_ref().map(file),
        debian: meta.debian.as_ref().map(file),
        native: meta.native,
    }))
}
