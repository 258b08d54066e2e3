//! Durable rebuild-attempt records.
//!
//! Every terminal pipeline state writes one row, best-effort: a failed write
//! is logged and must never change the verdict returned to the caller.

use async_trait::async_trait;
use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use rebuildr_schema::{Ecosystem, Target};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::errors::RebuildResult;
use crate::verify::MatchKind;

/// One durable attempt row, keyed by `(target, attempt id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildAttempt {
    /// Target ecosystem
    pub ecosystem: Ecosystem,
    /// Target package
    pub package: String,
    /// Target version
    pub version: String,
    /// Target artifact
    pub artifact: String,
    /// The run id of the attempt
    pub attempt_id: String,
    /// Whether the attempt ended in a published bundle
    pub success: bool,
    /// Error or mismatch detail; empty on success
    pub message: String,
    /// Which strategy variant drove the build
    pub strategy_kind: String,
    /// Executor version that ran the build
    pub executor_version: String,
    /// Worker-assigned build id
    pub build_id: String,
    /// The Dockerfile the build ran in
    pub dockerfile: String,
    /// How the comparison resolved, when it got that far
    pub match_kind: Option<MatchKind>,
    /// When the attempt started
    pub started_at: DateTime<Utc>,
    /// When the attempt reached a terminal state
    pub finished_at: DateTime<Utc>,
}

impl RebuildAttempt {
    /// A skeleton row for `target` in run `attempt_id`.
    pub fn started(target: &Target, attempt_id: &str, started_at: DateTime<Utc>) -> Self {
        RebuildAttempt {
            ecosystem: target.ecosystem,
            package: target.package.clone(),
            version: target.version.clone(),
            artifact: target.artifact.clone(),
            attempt_id: attempt_id.to_owned(),
            success: false,
            message: String::new(),
            strategy_kind: String::new(),
            executor_version: String::new(),
            build_id: String::new(),
            dockerfile: String::new(),
            match_kind: None,
            started_at,
            finished_at: started_at,
        }
    }
}

/// Where attempt rows go.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Persist one row.
    async fn record(&self, attempt: &RebuildAttempt) -> RebuildResult<()>;
}

/// In-memory attempt store.
#[derive(Default)]
pub struct MemAttemptStore {
    rows: Mutex<Vec<RebuildAttempt>>,
}

impl MemAttemptStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded rows.
    pub fn rows(&self) -> Vec<RebuildAttempt> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttemptStore for MemAttemptStore {
    async fn record(&self, attempt: &RebuildAttempt) -> RebuildResult<()> {
        self.rows.lock().unwrap().push(attempt.clone());
        Ok(())
    }
}

/// Attempt store writing one JSON file per row under a root directory.
#[derive(Debug, Clone)]
pub struct FsAttemptStore {
    root: Utf8PathBuf,
}

impl FsAttemptStore {
    /// A store rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        FsAttemptStore { root: root.into() }
    }
}

#[async_trait]
impl AttemptStore for FsAttemptStore {
    async fn record(&self, attempt: &RebuildAttempt) -> RebuildResult<()> {
        let encoded_package = attempt.package.replace('/', "!");
        let dir = self
            .root
            .join(attempt.ecosystem.as_str())
            .join(&encoded_package)
            .join(&attempt.version)
            .join(&attempt.artifact);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", attempt.attempt_id));
        tokio::fs::write(&path, serde_json::to_vec_pretty(attempt)?).await?;
        Ok(())
    }
}
