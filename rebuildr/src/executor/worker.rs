//! The long-running-operation worker interface.
//!
//! The executor submits a compiled build plan and gets back an operation
//! name; everything after that is polling. The HTTP implementation talks to
//! the external build worker; the in-memory one is scriptable and backs tests
//! and local smoke runs.

use async_trait::async_trait;
use rebuildr_schema::Target;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::plan::BuildPlan;
use crate::assets::{Asset, AssetKind, AssetStore};
use crate::errors::{RebuildError, RebuildResult};

/// Terminal and non-terminal operation statuses, as the worker reports them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Still running
    Pending,
    /// Build completed and uploaded
    Success,
    /// Build script failed
    Failure,
    /// Worker-side timeout
    Timeout,
    /// Cancelled on request
    Cancelled,
    /// Worker infrastructure error
    InternalError,
    /// Operation record expired before completion
    Expired,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerStatus::Pending => "PENDING",
            WorkerStatus::Success => "SUCCESS",
            WorkerStatus::Failure => "FAILURE",
            WorkerStatus::Timeout => "TIMEOUT",
            WorkerStatus::Cancelled => "CANCELLED",
            WorkerStatus::InternalError => "INTERNAL_ERROR",
            WorkerStatus::Expired => "EXPIRED",
        };
        f.write_str(name)
    }
}

/// A snapshot of one remote operation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct OperationState {
    /// Whether the operation reached a terminal status
    pub done: bool,
    /// Current status
    pub status: WorkerStatus,
    /// Worker-reported detail for terminal failures
    #[serde(default)]
    pub detail: String,
    /// Worker-assigned build id, once known
    #[serde(default)]
    pub build_id: Option<String>,
}

/// The external build worker, seen as a long-running-operation service.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Submit a plan; returns the operation name immediately.
    async fn submit(&self, target: &Target, plan: &BuildPlan) -> RebuildResult<String>;
    /// Poll an operation.
    async fn poll(&self, operation: &str) -> RebuildResult<OperationState>;
    /// Ask the worker to abort an operation.
    async fn cancel(&self, operation: &str) -> RebuildResult<()>;
}

/// Worker speaking JSON over HTTP.
pub struct HttpWorker {
    client: reqwest::Client,
    endpoint: url::Url,
}

impl HttpWorker {
    /// A worker client rooted at `endpoint`.
    pub fn new(client: reqwest::Client, endpoint: url::Url) -> Self {
        HttpWorker { client, endpoint }
    }
}

#[derive(serde::Serialize)]
struct SubmitRequest<'a> {
    target: &'a Target,
    plan: &'a BuildPlan,
}

#[derive(serde::Deserialize)]
struct SubmitResponse {
    name: String,
}

#[async_trait]
impl Worker for HttpWorker {
    async fn submit(&self, target: &Target, plan: &BuildPlan) -> RebuildResult<String> {
        let url = self.endpoint.join("v1/builds")?;
        let resp: SubmitResponse = self
            .client
            .post(url)
            .json(&SubmitRequest { target, plan })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.name)
    }

    async fn poll(&self, operation: &str) -> RebuildResult<OperationState> {
        let url = self.endpoint.join(&format!("v1/{operation}"))?;
        Ok(self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    async fn cancel(&self, operation: &str) -> RebuildResult<()> {
        let url = self.endpoint.join(&format!("v1/{operation}:cancel"))?;
        self.client
            .post(url)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// One scripted outcome for the in-memory worker.
#[derive(Debug, Clone)]
pub struct PlannedBuild {
    /// Terminal status the operation will reach
    pub status: WorkerStatus,
    /// Detail for failures
    pub detail: String,
    /// Bytes "uploaded" as the rebuilt artifact on success
    pub artifact: Option<Vec<u8>>,
    /// How many polls the operation stays pending for
    pub pending_polls: usize,
}

impl PlannedBuild {
    /// A successful build producing `artifact`.
    pub fn success(artifact: &[u8]) -> Self {
        PlannedBuild {
            status: WorkerStatus::Success,
            detail: String::new(),
            artifact: Some(artifact.to_vec()),
            pending_polls: 0,
        }
    }

    /// A terminal failure.
    pub fn failure(status: WorkerStatus, detail: &str) -> Self {
        PlannedBuild {
            status,
            detail: detail.to_owned(),
            artifact: None,
            pending_polls: 0,
        }
    }
}

struct MemOperation {
    state: OperationState,
    terminal: WorkerStatus,
    terminal_detail: String,
    pending_polls: usize,
    cancelled: bool,
}

/// Scriptable in-process worker. Successful operations write the scripted
/// artifact (and a build-info stub) through the store the worker was built
/// with, which is exactly what the remote worker does via the upload tool.
pub struct MemWorker {
    store: Arc<dyn AssetStore>,
    planned: Mutex<VecDeque<PlannedBuild>>,
    operations: Mutex<std::collections::HashMap<String, MemOperation>>,
}

impl MemWorker {
    /// A worker uploading into `store`.
    pub fn new(store: Arc<dyn AssetStore>) -> Self {
        MemWorker {
            store,
            planned: Mutex::new(VecDeque::new()),
            operations: Mutex::new(Default::default()),
        }
    }

    /// Script the next submitted build.
    pub fn plan_next(&self, build: PlannedBuild) {
        self.planned.lock().unwrap().push_back(build);
    }

    /// Whether an operation was asked to cancel.
    pub fn was_cancelled(&self, operation: &str) -> bool {
        self.operations
            .lock()
            .unwrap()
            .get(operation)
            .is_some_and(|op| op.cancelled)
    }
}

#[async_trait]
impl Worker for MemWorker {
    async fn submit(&self, target: &Target, _plan: &BuildPlan) -> RebuildResult<String> {
        let planned = self
            .planned
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PlannedBuild::failure(WorkerStatus::InternalError, "unscripted"));
        let name = format!("operations/{}", uuid::Uuid::new_v4());

        if planned.status == WorkerStatus::Success {
            if let Some(artifact) = &planned.artifact {
                let asset = Asset::new(AssetKind::RebuiltArtifact, target.clone());
                self.store.write(&asset, artifact).await?;
                let info = Asset::new(AssetKind::BuildInfo, target.clone());
                let body = serde_json::json!({"target": target, "builder": "mem-worker"});
                self.store
                    .write(&info, serde_json::to_vec(&body)?.as_slice())
                    .await?;
            }
        }

        self.operations.lock().unwrap().insert(
            name.clone(),
            MemOperation {
                state: OperationState {
                    done: false,
                    status: WorkerStatus::Pending,
                    detail: String::new(),
                    build_id: Some(format!("build-{}", &name[11..19])),
                },
                terminal: planned.status,
                terminal_detail: planned.detail,
                pending_polls: planned.pending_polls,
                cancelled: false,
            },
        );
        Ok(name)
    }

    async fn poll(&self, operation: &str) -> RebuildResult<OperationState> {
        let mut operations = self.operations.lock().unwrap();
        let op = operations
            .get_mut(operation)
            .ok_or_else(|| RebuildError::not_found(format!("operation {operation}")))?;
        if !op.state.done {
            if op.cancelled {
                op.state.done = true;
                op.state.status = WorkerStatus::Cancelled;
            } else if op.pending_polls > 0 {
                op.pending_polls -= 1;
            } else {
                op.state.done = true;
                op.state.status = op.terminal;
                op.state.detail = op.terminal_detail.clone();
            }
        }
        Ok(op.state.clone())
    }

    async fn cancel(&self, operation: &str) -> RebuildResult<()> {
        let mut operations = self.operations.lock().unwrap();
        let op = operations
            .get_mut(operation)
            .ok_or_else(|| RebuildError::not_found(format!("operation {operation}")))?;
        op.cancelled = true;
        Ok(())
    }
}
