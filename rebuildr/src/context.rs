//! The per-request context bag.
//!
//! Each HTTP request or queue task gets one of these: a run identifier and
//! the two build deadlines, plus a cancellation token for callers that go
//! away. There is deliberately no ambient context; everything that needs one
//! takes it as an argument.

use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Request-scoped state threaded through the pipeline and executor.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Opaque id grouping the attempts of one run (benchmark batch or feed
    /// invocation)
    pub run_id: String,
    /// When the orchestrator stops polling the remote build
    pub wait_deadline: Option<Instant>,
    /// When the remote build itself must be aborted
    pub cancel_deadline: Option<Instant>,
    /// Set when the caller has gone away
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// A context with no deadlines.
    pub fn new(run_id: impl Into<String>) -> Self {
        RequestContext {
            run_id: run_id.into(),
            wait_deadline: None,
            cancel_deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach the two-tier build deadlines.
    ///
    /// The wait deadline bounds local polling; the cancel deadline is when the
    /// remote operation is forced to abort. Waiting may stop before the remote
    /// op is cancelled, so slow builds can finish asynchronously.
    pub fn with_deadlines(
        mut self,
        wait_deadline: Option<Instant>,
        cancel_deadline: Option<Instant>,
    ) -> Self {
        self.wait_deadline = wait_deadline;
        self.cancel_deadline = cancel_deadline;
        self
    }

    /// True once the wait deadline has passed.
    pub fn wait_expired(&self) -> bool {
        self.wait_deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// True once the cancel deadline has passed.
    pub fn cancel_expired(&self) -> bool {
        self.cancel_deadline.is_some_and(|d| Instant::now() >= d)
    }
}
