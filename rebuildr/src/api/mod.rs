//! The HTTP surface.
//!
//! All service endpoints are POST with form-encoded bodies and JSON
//! responses; the gateway redirect is the lone GET. Error kinds map to HTTP
//! status codes through one table ([`crate::errors::ErrorKind::http_status`])
//! and positive retry delays round-trip via `Retry-After`.

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use rebuildr_schema::strategy::StrategyOneOf;
use rebuildr_schema::{Ecosystem, Target};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

use crate::assets::ATTESTATION_BUNDLE_FILE;
use crate::context::RequestContext;
use crate::errors::{RebuildError, RebuildResult};
use crate::feed::{Feed, ReleaseEvent};
use crate::gateway::RateLimiter;
use crate::infer::InferenceService;
use crate::pipeline::{OverwriteMode, RebuildPipeline, RebuildRequest, Verdict};

/// How many versions a smoketest covers when the request names none.
pub const DEFAULT_SMOKETEST_VERSIONS: usize = 5;

/// One benchmark run registration.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    /// Benchmark set name
    pub benchmark_name: String,
    /// Hash of the benchmark set
    pub benchmark_hash: String,
    /// Run type (smoketest, attest, ...)
    pub run_type: String,
}

/// Shared state behind every handler.
pub struct AppState {
    /// The orchestrator
    pub pipeline: Arc<RebuildPipeline>,
    /// The inference service
    pub inference: Arc<InferenceService>,
    /// Egress rate limiter, when this instance serves the gateway
    pub gateway: Option<Arc<RateLimiter>>,
    /// Release feed, when this instance ingests object events
    pub feed: Option<Arc<Feed>>,
    /// This binary's service version
    pub service_version: String,
    /// Registered benchmark runs
    pub runs: Mutex<HashMap<String, RunRecord>>,
    /// Extra local polling time past the build timeout
    pub wait_grace: Duration,
    /// Extra remote lifetime past the wait deadline
    pub cancel_grace: Duration,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/smoketest", post(smoketest))
        .route("/rebuild", post(rebuild))
        .route("/infer", post(infer))
        .route("/version", post(version))
        .route("/runs", post(runs))
        .route("/enqueue", post(enqueue))
        .route("/", get(gateway_redirect))
        .with_state(state)
}

/// Error wrapper implementing the status mapping.
pub struct ApiError(pub RebuildError);

impl From<RebuildError> for ApiError {
    fn from(err: RebuildError) -> Self {
        ApiError(err)
    }
}

impl From<rebuildr_schema::TargetError> for ApiError {
    fn from(err: rebuildr_schema::TargetError) -> Self {
        ApiError(RebuildError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut headers = HeaderMap::new();
        if let Some(retry_after) = self.0.retry_after() {
            if let Ok(value) = retry_after.as_secs().to_string().parse() {
                headers.insert(header::RETRY_AFTER, value);
            }
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string(),
            "code": kind.as_str(),
        }));
        (status, headers, body).into_response()
    }
}

fn require(field: Option<String>, name: &str) -> RebuildResult<String> {
    match field {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(RebuildError::invalid_argument(format!(
            "missing required field: {name}"
        ))),
    }
}

fn parse_bool(field: Option<String>) -> bool {
    matches!(field.as_deref(), Some("true") | Some("1"))
}

/// Parse a Go-style duration (`900s`, `15m`, `1h30m`); bare digits are
/// seconds.
pub fn parse_duration(raw: &str) -> RebuildResult<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(RebuildError::invalid_argument("empty duration"));
    }
    if raw.chars().all(|c| c.is_ascii_digit()) {
        return Ok(Duration::from_secs(raw.parse().map_err(|_| {
            RebuildError::invalid_argument(format!("malformed duration: {raw}"))
        })?));
    }
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| {
            RebuildError::invalid_argument(format!("malformed duration: {raw}"))
        })?;
        digits.clear();
        let unit = match c {
            'h' => Duration::from_secs(3600),
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                Duration::from_millis(1)
            }
            'm' => Duration::from_secs(60),
            's' => Duration::from_secs(1),
            _ => {
                return Err(RebuildError::invalid_argument(format!(
                    "malformed duration: {raw}"
                )))
            }
        };
        total += unit * value as u32;
    }
    if !digits.is_empty() {
        return Err(RebuildError::invalid_argument(format!(
            "malformed duration: {raw}"
        )));
    }
    Ok(total)
}

/// The JSON shape of one verdict.
#[derive(Debug, Serialize)]
pub struct VerdictBody {
    /// The attempted target
    pub target: Target,
    /// Empty on success
    pub message: String,
    /// The strategy the attempt used, once known
    #[serde(rename = "strategyOneof", skip_serializing_if = "Option::is_none")]
    pub strategy_oneof: Option<StrategyOneOf>,
}

impl From<Verdict> for VerdictBody {
    fn from(verdict: Verdict) -> Self {
        VerdictBody {
            target: verdict.target,
            message: verdict.message,
            strategy_oneof: verdict.strategy,
        }
    }
}

#[derive(Deserialize)]
struct SmoketestForm {
    ecosystem: Option<String>,
    pkg: Option<String>,
    versions: Option<String>,
    id: Option<String>,
}

#[derive(Serialize)]
struct SmoketestResponse {
    executor: String,
    verdicts: Vec<VerdictBody>,
}

async fn smoketest(
    State(state): State<Arc<AppState>>,
    Form(form): Form<SmoketestForm>,
) -> Result<Json<SmoketestResponse>, ApiError> {
    let ecosystem: Ecosystem = require(form.ecosystem, "ecosystem")?.parse()?;
    let package = require(form.pkg, "pkg")?;
    let run_id = require(form.id, "id")?;
    let versions: Vec<String> = form
        .versions
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .collect();

    let ctx = RequestContext::new(run_id);
    let verdicts = state
        .pipeline
        .smoketest(&ctx, ecosystem, &package, versions, DEFAULT_SMOKETEST_VERSIONS)
        .await?;
    Ok(Json(SmoketestResponse {
        executor: state.pipeline.executor.version().to_owned(),
        verdicts: verdicts.into_iter().map(Into::into).collect(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RebuildForm {
    ecosystem: Option<String>,
    package: Option<String>,
    version: Option<String>,
    artifact: Option<String>,
    id: Option<String>,
    strategy_from_repo: Option<String>,
    use_network_proxy: Option<String>,
    use_syscall_monitor: Option<String>,
    overwrite_mode: Option<String>,
    build_timeout: Option<String>,
}

async fn rebuild(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RebuildForm>,
) -> Result<Response, ApiError> {
    let ecosystem: Ecosystem = require(form.ecosystem, "ecosystem")?.parse()?;
    let package = require(form.package, "package")?;
    let version = require(form.version, "version")?;
    let run_id = require(form.id, "id")?;
    let overwrite: OverwriteMode = form.overwrite_mode.unwrap_or_default().parse()?;
    let build_timeout = match form.build_timeout.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(parse_duration(raw)?),
    };

    let artifact = match form.artifact {
        Some(artifact) if !artifact.is_empty() => artifact,
        _ => {
            state
                .pipeline
                .default_artifact(ecosystem, &package, &version)
                .await?
        }
    };
    let target = Target::new(ecosystem, package, version, artifact)?;

    let timeout = build_timeout.unwrap_or(state.pipeline.build_options.timeout);
    let now = Instant::now();
    let ctx = RequestContext::new(run_id).with_deadlines(
        Some(now + timeout + state.wait_grace),
        Some(now + timeout + state.wait_grace + state.cancel_grace),
    );

    let request = RebuildRequest {
        target,
        strategy_from_repo: parse_bool(form.strategy_from_repo),
        use_network_proxy: parse_bool(form.use_network_proxy),
        use_syscall_monitor: parse_bool(form.use_syscall_monitor),
        overwrite,
        build_timeout,
        strategy: None,
    };
    let verdict = state.pipeline.rebuild_package(&ctx, &request).await?;

    let status = verdict
        .error_kind
        .map(|kind| {
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        })
        .unwrap_or(StatusCode::OK);
    Ok((status, Json(VerdictBody::from(verdict))).into_response())
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InferForm {
    ecosystem: Option<String>,
    package: Option<String>,
    version: Option<String>,
    artifact: Option<String>,
    strategy_hint: Option<String>,
}

async fn infer(
    State(state): State<Arc<AppState>>,
    Form(form): Form<InferForm>,
) -> Result<Json<StrategyOneOf>, ApiError> {
    let ecosystem: Ecosystem = require(form.ecosystem, "ecosystem")?.parse()?;
    let package = require(form.package, "package")?;
    let version = require(form.version, "version")?;
    let hint: Option<StrategyOneOf> = match form.strategy_hint.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(serde_json::from_str(raw).map_err(|err| {
            RebuildError::invalid_argument(format!("malformed strategy hint: {err}"))
        })?),
    };

    let artifact = match form.artifact {
        Some(artifact) if !artifact.is_empty() => artifact,
        _ => {
            state
                .pipeline
                .default_artifact(ecosystem, &package, &version)
                .await?
        }
    };
    let target = Target::new(ecosystem, package, version, artifact)?;
    let oneof = state.inference.infer(&target, hint.as_ref()).await?;
    Ok(Json(oneof))
}

#[derive(Deserialize)]
struct VersionForm {
    service: Option<String>,
}

async fn version(
    State(state): State<Arc<AppState>>,
    Form(form): Form<VersionForm>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let version = match form.service.as_deref().unwrap_or("") {
        "" => state.service_version.clone(),
        "inference" => state.inference.version().to_owned(),
        other => {
            return Err(ApiError(RebuildError::invalid_argument(format!(
                "unknown service: {other}"
            ))))
        }
    };
    Ok(Json(serde_json::json!({ "version": version })))
}

#[derive(Deserialize)]
struct RunsForm {
    benchmark_name: Option<String>,
    benchmark_hash: Option<String>,
    #[serde(rename = "type")]
    run_type: Option<String>,
}

async fn runs(
    State(state): State<Arc<AppState>>,
    Form(form): Form<RunsForm>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let id = uuid::Uuid::new_v4().to_string();
    let record = RunRecord {
        benchmark_name: form.benchmark_name.unwrap_or_default(),
        benchmark_hash: form.benchmark_hash.unwrap_or_default(),
        run_type: form.run_type.unwrap_or_default(),
    };
    info!(%id, benchmark = %record.benchmark_name, "registered run");
    state.runs.lock().unwrap().insert(id.clone(), record);
    Ok(Json(serde_json::json!({ "id": id })))
}

/// The minimal object-notification shape the enqueue endpoint consumes.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectEvent {
    /// Object path inside the bucket
    pub name: String,
    /// Bucket name
    #[serde(default)]
    pub bucket: String,
    /// Object generation
    #[serde(default)]
    pub generation: Option<String>,
    /// Creation timestamp
    #[serde(default)]
    pub time_created: Option<String>,
    /// Update timestamp
    #[serde(default)]
    pub updated: Option<String>,
    /// Object size in bytes
    #[serde(default)]
    pub size: Option<String>,
}

/// Parse an attestation-bundle object path into the release event it
/// announces. The name must be exactly 5 slash-separated segments (6 when
/// the package has a scope or a Debian component) ending in the reserved
/// bundle filename.
pub fn parse_bundle_object_name(name: &str) -> RebuildResult<ReleaseEvent> {
    let segments: Vec<&str> = name.split('/').collect();
    let (ecosystem_raw, package, version, artifact) = match segments.as_slice() {
        [eco, pkg, version, artifact, last] if *last == ATTESTATION_BUNDLE_FILE => {
            (*eco, (*pkg).to_owned(), *version, *artifact)
        }
        [eco, mid, pkg, version, artifact, last] if *last == ATTESTATION_BUNDLE_FILE => {
            // npm scope or debian component occupies the extra segment
            if *eco == "debian" {
                (*eco, (*pkg).to_owned(), *version, *artifact)
            } else {
                (*eco, format!("{mid}/{pkg}"), *version, *artifact)
            }
        }
        _ => {
            return Err(RebuildError::invalid_argument(format!(
                "object name is not an attestation bundle path: {name}"
            )))
        }
    };
    let ecosystem: Ecosystem = ecosystem_raw.parse()?;
    if package.is_empty() || version.is_empty() || artifact.is_empty() {
        return Err(RebuildError::invalid_argument(format!(
            "object name has empty segments: {name}"
        )));
    }
    Ok(ReleaseEvent {
        ecosystem,
        package: Target::decode_package(&package),
        version: version.to_owned(),
        artifact: Some(artifact.to_owned()),
    })
}

async fn enqueue(
    State(state): State<Arc<AppState>>,
    Json(event): Json<ObjectEvent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let feed = state.feed.as_ref().ok_or_else(|| {
        ApiError(RebuildError::unimplemented("no feed configured on this instance"))
    })?;
    let release = parse_bundle_object_name(&event.name)?;
    let enqueued = feed.ingest(vec![release]).await?;
    Ok(Json(serde_json::json!({ "enqueued": enqueued })))
}

#[derive(Deserialize)]
struct GatewayQuery {
    uri: Option<String>,
}

async fn gateway_redirect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<GatewayQuery>,
) -> Result<Response, ApiError> {
    let gateway = state.gateway.as_ref().ok_or_else(|| {
        ApiError(RebuildError::unimplemented("no gateway configured on this instance"))
    })?;
    let raw = require(query.uri, "uri")?;
    let uri: url::Url = raw.parse().map_err(|_| {
        ApiError(RebuildError::invalid_argument(format!("malformed uri: {raw}")))
    })?;
    let host = uri
        .host_str()
        .ok_or_else(|| ApiError(RebuildError::invalid_argument("uri has no host")))?;

    let cancel = tokio_util::sync::CancellationToken::new();
    gateway.acquire(host, &cancel).await?;

    let location = raw.parse().map_err(|_| {
        ApiError(RebuildError::invalid_argument("uri is not a valid header value"))
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(header::LOCATION, location);
    Ok((StatusCode::FOUND, headers).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_parse() {
        assert_eq!(parse_duration("900").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("900s").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5400)
        );
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("15x").is_err());
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("15m3").is_err());
    }

    #[test]
    fn bundle_object_names_parse() {
        let event = parse_bundle_object_name(
            "pypi/absl-py/2.0.0/absl_py-2.0.0-py3-none-any.whl/rebuild.intoto.jsonl",
        )
        .unwrap();
        assert_eq!(event.ecosystem, Ecosystem::Pypi);
        assert_eq!(event.package, "absl-py");
        assert_eq!(
            event.artifact.as_deref(),
            Some("absl_py-2.0.0-py3-none-any.whl")
        );

        // npm scope takes a sixth segment
        let scoped = parse_bundle_object_name(
            "npm/@types/node/20.1.0/node-20.1.0.tgz/rebuild.intoto.jsonl",
        )
        .unwrap();
        assert_eq!(scoped.package, "@types/node");

        // debian component takes a sixth segment without joining the package
        let deb = parse_bundle_object_name(
            "debian/main/xz-utils/5.4.1/xz-utils_5.4.1_amd64.deb/rebuild.intoto.jsonl",
        )
        .unwrap();
        assert_eq!(deb.package, "xz-utils");
    }

    #[test]
    fn bad_bundle_object_names_rejected() {
        // wrong trailing segment
        assert!(parse_bundle_object_name("pypi/absl-py/2.0.0/a.whl/info.json").is_err());
        // wrong segment count
        assert!(parse_bundle_object_name("pypi/absl-py/rebuild.intoto.jsonl").is_err());
        assert!(parse_bundle_object_name(
            "pypi/a/b/c/d/e/rebuild.intoto.jsonl"
        )
        .is_err());
        // unknown ecosystem
        assert!(parse_bundle_object_name(
            "rubygems/rails/7.0.0/rails-7.0.0.gem/rebuild.intoto.jsonl"
        )
        .is_err());
    }
}
