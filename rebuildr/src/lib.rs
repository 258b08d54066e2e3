#![deny(missing_docs)]

//! # rebuildr
//!
//! Rebuilds release artifacts of open-source package ecosystems from source,
//! compares them against the published upstream bytes (exactly, or after
//! content-preserving stabilization), and publishes signed provenance
//! attestation bundles for the ones that match.
//!
//! The crate is a library plus one binary: the service endpoints live in
//! [`api`][], the per-target orchestration in [`pipeline`][], and the three
//! load-bearing subsystems in [`stabilize`][] (archive canonicalization),
//! [`executor`][] (remote sandboxed builds), and [`verify`][]/[`sign`][]
//! (attestation assembly and KMS-backed signing).

pub mod api;
pub mod assets;
pub mod attempts;
pub mod changelog;
pub mod context;
pub mod errors;
pub mod executor;
pub mod feed;
pub mod gateway;
pub mod gitsource;
pub mod infer;
pub mod net;
pub mod pipeline;
pub mod registry;
pub mod sign;
pub mod stabilize;
pub mod verify;

#[cfg(test)]
mod tests;

pub use errors::{ErrorKind, RebuildError, RebuildResult};

/// Build-time identity gathered by the `built` crate.
#[allow(missing_docs)]
pub mod build_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// The service's embedded source identity, overridable for dev deployments
/// via `REBUILDR_BUILD_REPO` / `REBUILDR_BUILD_VERSION`.
pub fn service_identity() -> verify::ServiceIdentity {
    let repo = std::env::var("REBUILDR_BUILD_REPO").unwrap_or_else(|_| {
        if build_info::PKG_REPOSITORY.is_empty() {
            format!("file://{}", build_info::PKG_NAME)
        } else {
            build_info::PKG_REPOSITORY.to_owned()
        }
    });
    let version = std::env::var("REBUILDR_BUILD_VERSION")
        .unwrap_or_else(|_| format!("v{}", build_info::PKG_VERSION));
    verify::ServiceIdentity { repo, version }
}
