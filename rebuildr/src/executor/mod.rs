//! The remote build executor.
//!
//! Compiles a strategy into a sandboxed build plan, submits it to the
//! external long-running-operation worker, and tracks the operation until a
//! terminal status, a deadline, or caller cancellation. A build is only `ok`
//! once the rebuilt artifact is observable through the configured asset
//! store; a worker saying SUCCESS is not enough.

use chrono::{DateTime, Utc};
use rebuildr_schema::strategy::Strategy;
use rebuildr_schema::Target;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub mod plan;
pub mod worker;

pub use plan::{generate_plan, uses_timewarp, BuildPlan, RemoteBuildOptions, ToolUrls, WorkerStep};
pub use worker::{MemWorker, OperationState, PlannedBuild, Worker, WorkerStatus};

use crate::assets::{Asset, AssetKind, AssetStore};
use crate::context::RequestContext;
use crate::errors::{RebuildError, RebuildResult};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const CANCEL_SETTLE: Duration = Duration::from_secs(10);

/// The executor: a worker client plus the store the worker uploads through.
pub struct RemoteBuildExecutor {
    worker: Arc<dyn Worker>,
    store: Arc<dyn AssetStore>,
    version: String,
}

/// What a finished build hands back to the pipeline.
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// Worker-assigned build id
    pub build_id: String,
    /// The Dockerfile the build ran in
    pub dockerfile: String,
    /// When the executor submitted the operation
    pub started_at: DateTime<Utc>,
    /// When the terminal status was observed
    pub finished_at: DateTime<Utc>,
}

impl RemoteBuildExecutor {
    /// An executor over `worker`, observing uploads through `store`.
    pub fn new(
        worker: Arc<dyn Worker>,
        store: Arc<dyn AssetStore>,
        version: impl Into<String>,
    ) -> Self {
        RemoteBuildExecutor {
            worker,
            store,
            version: version.into(),
        }
    }

    /// The executor version recorded in attempt rows.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Compile and submit; returns immediately with a handle.
    pub async fn start(
        &self,
        ctx: &RequestContext,
        target: &Target,
        strategy: &Strategy,
        options: &RemoteBuildOptions,
    ) -> RebuildResult<BuildHandle> {
        let plan = generate_plan(target, strategy, options)?;
        let operation = self.worker.submit(target, &plan).await?;
        info!(run_id = %ctx.run_id, %target, %operation, "submitted remote build");
        Ok(BuildHandle {
            operation,
            plan,
            target: target.clone(),
            worker: self.worker.clone(),
            store: self.store.clone(),
            started_at: Utc::now(),
        })
    }
}

/// A submitted build, bound to its operation name.
pub struct BuildHandle {
    operation: String,
    plan: BuildPlan,
    target: Target,
    worker: Arc<dyn Worker>,
    store: Arc<dyn AssetStore>,
    started_at: DateTime<Utc>,
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
        }
        None => std::future::pending().await,
    }
}

impl BuildHandle {
    /// The remote operation name.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// The Dockerfile the submitted plan runs in.
    pub fn dockerfile(&self) -> &str {
        &self.plan.dockerfile
    }

    /// The ordered worker steps of the submitted plan.
    pub fn steps(&self) -> &[WorkerStep] {
        &self.plan.steps
    }

    /// Poll until terminal, honoring the context's wait/cancel deadlines.
    pub async fn wait(&self, ctx: &RequestContext) -> RebuildResult<BuildOutcome> {
        loop {
            let state = self.worker.poll(&self.operation).await?;
            if state.done {
                return self.finish(state).await;
            }
            if ctx.wait_expired() {
                return self.abandon(ctx).await;
            }
            tokio::select! {
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
                _ = until(ctx.wait_deadline) => {
                    return self.abandon(ctx).await;
                }
                _ = ctx.cancel.cancelled() => {
                    if let Err(err) = self.worker.cancel(&self.operation).await {
                        warn!("failed to cancel {}: {err}", self.operation);
                    }
                    return Err(RebuildError::Canceled {
                        message: format!("build {} abandoned by caller", self.operation),
                    });
                }
            }
        }
    }

    // The wait deadline has passed. If the cancel deadline has too, force the
    // worker to abort and give the cancellation a moment to register;
    // otherwise leave the operation running so slow builds can finish
    // asynchronously.
    async fn abandon(&self, ctx: &RequestContext) -> RebuildResult<BuildOutcome> {
        if ctx.cancel_expired() {
            if let Err(err) = self.worker.cancel(&self.operation).await {
                warn!("failed to cancel {}: {err}", self.operation);
            }
            let settle_until = Instant::now() + CANCEL_SETTLE;
            while Instant::now() < settle_until {
                match self.worker.poll(&self.operation).await {
                    Ok(state) if state.done => break,
                    Ok(_) => tokio::time::sleep(Duration::from_secs(1)).await,
                    Err(_) => break,
                }
            }
        }
        Err(RebuildError::DeadlineExceeded {
            message: format!("build {} exceeded wait deadline", self.operation),
        })
    }

    async fn finish(&self, state: OperationState) -> RebuildResult<BuildOutcome> {
        match state.status {
            WorkerStatus::Success => {
                let asset = Asset::new(AssetKind::RebuiltArtifact, self.target.clone());
                if !self.store.exists(&asset).await? {
                    return Err(RebuildError::internal(format!(
                        "worker reported success but {} is not observable",
                        self.store.url(&asset)
                    )));
                }
                Ok(BuildOutcome {
                    build_id: state.build_id.unwrap_or_else(|| self.operation.clone()),
                    dockerfile: self.plan.dockerfile.clone(),
                    started_at: self.started_at,
                    finished_at: Utc::now(),
                })
            }
            WorkerStatus::Pending => Err(RebuildError::internal(
                "worker reported done with status PENDING",
            )),
            status => Err(RebuildError::BuildFailed {
                status: status.to_string(),
                detail: state.detail,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::MemStore;
    use rebuildr_schema::strategy::{ManualStrategy, Strategy};
    use rebuildr_schema::{Ecosystem, Location};

    fn target() -> Target {
        Target::new(Ecosystem::Npm, "left-pad", "1.3.0", "left-pad-1.3.0.tgz").unwrap()
    }

    fn manual_strategy() -> Strategy {
        Strategy::Manual(ManualStrategy {
            location: Location {
                repo: "https://github.com/stevemao/left-pad".to_owned(),
                git_ref: "9cbb52d".to_owned(),
                dir: String::new(),
            },
            deps: String::new(),
            build: "npm pack".to_owned(),
            system_deps: vec![],
            output_path: "left-pad-1.3.0.tgz".to_owned(),
        })
    }

    #[tokio::test]
    async fn successful_build_requires_observable_artifact() {
        let store = Arc::new(MemStore::new());
        let worker = Arc::new(MemWorker::new(store.clone()));
        let executor = RemoteBuildExecutor::new(worker.clone(), store.clone(), "test-exec");

        worker.plan_next(PlannedBuild::success(b"tgz-bytes"));
        let ctx = RequestContext::new("run-1");
        let handle = executor
            .start(&ctx, &target(), &manual_strategy(), &Default::default())
            .await
            .unwrap();
        let outcome = handle.wait(&ctx).await.unwrap();
        assert!(!outcome.build_id.is_empty());
        assert!(outcome.dockerfile.starts_with("FROM "));
    }

    #[tokio::test]
    async fn success_without_upload_is_an_error() {
        let store = Arc::new(MemStore::new());
        let worker = Arc::new(MemWorker::new(store.clone()));
        let executor = RemoteBuildExecutor::new(worker.clone(), store, "test-exec");

        worker.plan_next(PlannedBuild {
            status: WorkerStatus::Success,
            detail: String::new(),
            artifact: None,
            pending_polls: 0,
        });
        let ctx = RequestContext::new("run-2");
        let handle = executor
            .start(&ctx, &target(), &manual_strategy(), &Default::default())
            .await
            .unwrap();
        let err = handle.wait(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("not observable"));
    }

    #[tokio::test]
    async fn failure_statuses_map_to_typed_errors() {
        let store = Arc::new(MemStore::new());
        let worker = Arc::new(MemWorker::new(store.clone()));
        let executor = RemoteBuildExecutor::new(worker.clone(), store, "test-exec");

        worker.plan_next(PlannedBuild::failure(
            WorkerStatus::Timeout,
            "build exceeded 900s",
        ));
        let ctx = RequestContext::new("run-3");
        let handle = executor
            .start(&ctx, &target(), &manual_strategy(), &Default::default())
            .await
            .unwrap();
        match handle.wait(&ctx).await.unwrap_err() {
            RebuildError::BuildFailed { status, detail } => {
                assert_eq!(status, "TIMEOUT");
                assert_eq!(detail, "build exceeded 900s");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn caller_cancellation_cancels_the_operation() {
        let store = Arc::new(MemStore::new());
        let worker = Arc::new(MemWorker::new(store.clone()));
        let executor = RemoteBuildExecutor::new(worker.clone(), store, "test-exec");

        worker.plan_next(PlannedBuild {
            status: WorkerStatus::Success,
            detail: String::new(),
            artifact: Some(b"late".to_vec()),
            pending_polls: 1_000,
        });
        let ctx = RequestContext::new("run-4");
        let handle = executor
            .start(&ctx, &target(), &manual_strategy(), &Default::default())
            .await
            .unwrap();

        let operation = handle.operation().to_owned();
        ctx.cancel.cancel();
        let err = handle.wait(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::Canceled);
        assert!(worker.was_cancelled(&operation));
    }
}
