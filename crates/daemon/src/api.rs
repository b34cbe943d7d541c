//! HTTP control surface for autotranscode
//!
//! Exposes the shared queue, the node registry and this node's processing
//! state as a small JSON API.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::{LocalStatus, Orchestrator, OrchestratorError};
use crate::quiet::{parse_periods, QuietPeriod, QuietPeriodError};
use crate::stats::{daily_load, queue_stats, QueueStats};
use crate::store::{
    self, Job, JobKey, JobStore, Node, NodeKey, NodeRegistry, NodeStatus, QueueCounts, StoreError,
};

/// Errors that can occur when running the API server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address '{addr}': {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// Shared handles served by the router.
#[derive(Clone)]
pub struct AppState {
    pub jobs: JobStore,
    pub nodes: NodeRegistry,
    pub orchestrator: Arc<Orchestrator>,
}

/// Error returned by handlers, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "API request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(ErrorBody { error })).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => ApiError::NotFound(e.to_string()),
            StoreError::InvalidState(_) => ApiError::Conflict(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        match e {
            OrchestratorError::NotRunning => ApiError::NotFound(e.to_string()),
            OrchestratorError::Runner(crate::runner::RunnerError::InvalidState(_)) => {
                ApiError::Conflict(e.to_string())
            }
            OrchestratorError::Store(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<QuietPeriodError> for ApiError {
    fn from(e: QuietPeriodError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    pub message: String,
}

fn message(text: impl Into<String>) -> Json<Message> {
    Json(Message {
        message: text.into(),
    })
}

/// Response of `GET /queue/size`.
#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSize {
    pub size: usize,
    #[serde(flatten)]
    pub counts: QueueCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RetryAll {
    pub retried: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RemoveParams {
    /// Remove even when the node is not offline
    #[serde(default)]
    pub force: bool,
}

// Queue

async fn list_queue(State(state): State<AppState>) -> ApiResult<Vec<Job>> {
    let jobs = state.jobs.clone();
    Ok(Json(store::blocking(move || jobs.list()).await?))
}

async fn queue_size(State(state): State<AppState>) -> ApiResult<QueueSize> {
    let jobs = state.jobs.clone();
    let counts = store::blocking(move || jobs.count_by_status()).await?;
    Ok(Json(QueueSize {
        size: counts.total(),
        counts,
    }))
}

async fn queue_statistics(State(state): State<AppState>) -> ApiResult<QueueStats> {
    let jobs = state.jobs.clone();
    let all = store::blocking(move || jobs.list()).await?;
    Ok(Json(queue_stats(&all, Local::now().date_naive(), &Local)))
}

async fn queue_load(State(state): State<AppState>) -> ApiResult<BTreeMap<NaiveDate, f64>> {
    let jobs = state.jobs.clone();
    let all = store::blocking(move || jobs.list()).await?;
    Ok(Json(daily_load(&all, &Local)))
}

async fn retry_all(State(state): State<AppState>) -> ApiResult<RetryAll> {
    let jobs = state.jobs.clone();
    let retried = store::blocking(move || jobs.retry_all()).await?;
    tracing::info!(retried, "Retrying all failed media files");
    Ok(Json(RetryAll { retried }))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Job> {
    let jobs = state.jobs.clone();
    let key = JobKey::ById(id);
    let found = store::blocking({
        let key = key.clone();
        move || jobs.get(&key)
    })
    .await?;
    found
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("{} not found", key)))
}

async fn retry_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Job> {
    let jobs = state.jobs.clone();
    let job = store::blocking(move || jobs.retry_one(&JobKey::ById(id))).await?;
    tracing::info!(job = %job.identifier(), "Retrying media file");
    Ok(Json(job))
}

async fn delete_job(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Job> {
    let jobs = state.jobs.clone();
    let job = store::blocking(move || jobs.delete(&JobKey::ById(id))).await?;
    tracing::info!(job = %job.identifier(), "Deleted media file from queue");
    Ok(Json(job))
}

// Nodes

/// Resolves a path segment to a node key, trying the id first and then the
/// hostname.
fn resolve_node(nodes: &NodeRegistry, key: String) -> Result<NodeKey, StoreError> {
    let by_id = NodeKey::ById(key.clone());
    if nodes.get(&by_id)?.is_some() {
        return Ok(by_id);
    }
    let by_host = NodeKey::ByHostname(key);
    if nodes.get(&by_host)?.is_some() {
        return Ok(by_host);
    }
    Err(StoreError::NotFound(by_host.to_string()))
}

async fn with_node<T, F>(state: &AppState, key: String, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&NodeRegistry, &NodeKey) -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let nodes = state.nodes.clone();
    Ok(store::blocking(move || {
        let key = resolve_node(&nodes, key)?;
        f(&nodes, &key)
    })
    .await?)
}

async fn list_nodes(State(state): State<AppState>) -> ApiResult<Vec<Node>> {
    let nodes = state.nodes.clone();
    Ok(Json(store::blocking(move || nodes.list()).await?))
}

async fn get_node(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Node> {
    let node = with_node(&state, key, |nodes, key| {
        nodes
            .get(key)?
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    })
    .await?;
    Ok(Json(node))
}

async fn remove_node(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<RemoveParams>,
) -> ApiResult<Node> {
    let safe = !params.force;
    let node = with_node(&state, key, move |nodes, key| nodes.remove(key, safe)).await?;
    tracing::info!(node = %node.id, hostname = %node.hostname, "Removed node");
    Ok(Json(node))
}

async fn suspend_node(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Node> {
    let node = with_node(&state, key, |nodes, key| {
        nodes.set_status(key, NodeStatus::Suspended)
    })
    .await?;
    Ok(Json(node))
}

async fn resume_node(State(state): State<AppState>, Path(key): Path<String>) -> ApiResult<Node> {
    let node = with_node(&state, key, |nodes, key| {
        nodes.set_status(key, NodeStatus::Online)
    })
    .await?;
    Ok(Json(node))
}

async fn get_quiet_periods(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Vec<QuietPeriod>> {
    let periods = with_node(&state, key, |nodes, key| nodes.quiet_periods(key)).await?;
    Ok(Json(periods))
}

async fn set_quiet_periods(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(values): Json<Vec<String>>,
) -> ApiResult<Vec<QuietPeriod>> {
    // Validate before touching the registry.
    let periods = parse_periods(&values)?;
    let node = with_node(&state, key, move |nodes, key| {
        nodes.set_quiet_periods(key, &periods)
    })
    .await?;
    tracing::info!(hostname = %node.hostname, periods = ?values, "Quiet periods updated");
    Ok(Json(node.quiet_periods))
}

async fn clear_quiet_periods(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Message> {
    let node = with_node(&state, key, |nodes, key| nodes.clear_quiet_periods(key)).await?;
    Ok(message(format!("Quiet periods cleared for {}", node.hostname)))
}

// Local

async fn local_status(State(state): State<AppState>) -> Json<LocalStatus> {
    Json(state.orchestrator.status())
}

async fn local_suspend(State(state): State<AppState>) -> ApiResult<Message> {
    state.orchestrator.suspend()?;
    Ok(message("Media processing suspended"))
}

async fn local_resume(State(state): State<AppState>) -> ApiResult<Message> {
    state.orchestrator.resume()?;
    Ok(message("Media processing resumed"))
}

/// Creates the axum Router with every control endpoint
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/queue", get(list_queue))
        .route("/queue/size", get(queue_size))
        .route("/queue/stats", get(queue_statistics))
        .route("/queue/load", get(queue_load))
        .route("/queue/retry", put(retry_all))
        .route("/queue/:id", get(get_job).put(retry_job).delete(delete_job))
        .route("/nodes", get(list_nodes))
        .route("/nodes/:key", get(get_node).delete(remove_node))
        .route("/nodes/:key/suspend", put(suspend_node))
        .route("/nodes/:key/resume", put(resume_node))
        .route(
            "/nodes/:key/quiet-periods",
            get(get_quiet_periods)
                .put(set_quiet_periods)
                .delete(clear_quiet_periods),
        )
        .route("/local", get(local_status))
        .route("/local/suspend", put(local_suspend))
        .route("/local/resume", put(local_resume))
        .with_state(state)
}

/// Runs the API server until `shutdown` is cancelled
///
/// # Arguments
/// * `state` - Handles served by the API
/// * `bind` - Listen address, e.g. `127.0.0.1:7878`
/// * `shutdown` - Token that triggers graceful shutdown
///
/// # Returns
/// * `Ok(())` if server shuts down gracefully
/// * `Err(ServerError)` if server fails to start
pub async fn run_server(
    state: AppState,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), ServerError> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|source| ServerError::Bind {
            addr: bind.to_string(),
            source,
        })?;
    tracing::info!(addr = %bind, "Control API listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::OrchestratorSettings;
    use crate::store::{Database, JobStatus, NodeMetadata};
    use axum::body::Body;
    use axum::http::{Method, Request};
    use serde_json::{json, Value};
    use std::path::Path as FsPath;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let db = Database::open_in_memory().unwrap();
        let jobs = JobStore::new(db.clone(), "mp4");
        let nodes = NodeRegistry::new(db);
        nodes
            .upsert_with_metadata("node-1", "worker-1", NodeStatus::Online, || NodeMetadata {
                cpu_threads: 4,
                cpu_details: "Test CPU".into(),
            })
            .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            jobs.clone(),
            nodes.clone(),
            "worker-1",
            OrchestratorSettings {
                command: "true".into(),
                timeout: Duration::from_secs(60),
                delete_source: false,
                poll_interval: Duration::from_secs(1),
                monitor_interval: Duration::from_secs(60),
            },
        ));
        AppState {
            jobs,
            nodes,
            orchestrator,
        }
    }

    fn add_job(state: &AppState, id: &str, path: &str) -> Job {
        state
            .jobs
            .insert_if_absent(id, FsPath::new(path), false)
            .unwrap()
            .job()
            .clone()
    }

    async fn send(
        state: &AppState,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_list_queue_empty() {
        let state = state();
        let (status, body) = send(&state, Method::GET, "/queue", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_get_job_and_not_found() {
        let state = state();
        add_job(&state, "job-1", "/media/a.mkv");

        let (status, body) = send(&state, Method::GET, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");
        assert_eq!(body["path"], "/media/a.mkv");

        let (status, body) = send(&state, Method::GET, "/queue/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_retry_and_delete_respect_processing() {
        let state = state();
        add_job(&state, "job-1", "/media/a.mkv");
        let claimed = state.jobs.claim_next_waiting().unwrap().unwrap();

        let (status, _) = send(&state, Method::PUT, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        let (status, _) = send(&state, Method::DELETE, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        state.jobs.fail(&claimed).unwrap();
        let (status, body) = send(&state, Method::PUT, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "waiting");

        let (status, _) = send(&state, Method::DELETE, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = send(&state, Method::DELETE, "/queue/job-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_retry_all_and_size() {
        let state = state();
        add_job(&state, "job-1", "/media/a.mkv");
        add_job(&state, "job-2", "/media/b.mkv");
        let claimed = state.jobs.claim_next_waiting().unwrap().unwrap();
        state.jobs.fail(&claimed).unwrap();

        let (status, body) = send(&state, Method::GET, "/queue/size", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["size"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["waiting"], 1);

        let (status, body) = send(&state, Method::PUT, "/queue/retry", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["retried"], 1);
        assert_eq!(
            state.jobs.count_by_status().unwrap().waiting,
            2,
            "failed job should be waiting again"
        );
    }

    #[tokio::test]
    async fn test_stats_and_load() {
        let state = state();
        add_job(&state, "job-1", "/media/a.mkv");
        let claimed = state.jobs.claim_next_waiting().unwrap().unwrap();
        state.jobs.complete(&claimed).unwrap();

        let (status, body) = send(&state, Method::GET, "/queue/stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let stats: QueueStats = serde_json::from_value(body).unwrap();
        assert_eq!(stats.average_processed_per_day, 1.0);

        let (status, body) = send(&state, Method::GET, "/queue/load", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_object());
    }

    #[tokio::test]
    async fn test_node_suspend_resume_by_hostname_or_id() {
        let state = state();

        let (status, body) = send(&state, Method::PUT, "/nodes/worker-1/suspend", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "suspended");

        let (status, body) = send(&state, Method::PUT, "/nodes/node-1/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");

        let (status, _) = send(&state, Method::PUT, "/nodes/ghost/suspend", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&state, Method::GET, "/nodes", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_periods_endpoints() {
        let state = state();

        let (status, body) = send(
            &state,
            Method::PUT,
            "/nodes/worker-1/quiet-periods",
            Some(json!(["22:00-23:00", "01:00-02:30"])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["22:00-23:00", "01:00-02:30"]));

        let (status, body) = send(
            &state,
            Method::PUT,
            "/nodes/worker-1/quiet-periods",
            Some(json!(["22:00-23:00", "25:00-26:00"])),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("25:00-26:00"));

        // The malformed request left the stored periods alone.
        let (status, body) = send(&state, Method::GET, "/nodes/worker-1/quiet-periods", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(["22:00-23:00", "01:00-02:30"]));

        let (status, _) = send(&state, Method::DELETE, "/nodes/worker-1/quiet-periods", None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = send(&state, Method::GET, "/nodes/worker-1/quiet-periods", None).await;
        assert_eq!(body, json!([]));
    }

    #[tokio::test]
    async fn test_remove_node_requires_offline_unless_forced() {
        let state = state();

        let (status, _) = send(&state, Method::DELETE, "/nodes/worker-1", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = send(&state, Method::DELETE, "/nodes/worker-1?force=true", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hostname"], "worker-1");

        let (status, _) = send(&state, Method::GET, "/nodes/worker-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_local_endpoints_without_run() {
        let state = state();

        let (status, body) = send(&state, Method::GET, "/local", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hostname"], "worker-1");
        assert_eq!(body["running"], false);
        assert!(body["job"].is_null());

        let (status, _) = send(&state, Method::PUT, "/local/suspend", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(&state, Method::PUT, "/local/resume", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_job_json_shape() {
        let state = state();
        add_job(&state, "job-1", "/media/a.mkv");

        let (_, body) = send(&state, Method::GET, "/queue", None).await;
        let jobs: Vec<Job> = serde_json::from_value(body).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Waiting);
        assert_eq!(jobs[0].output_path, FsPath::new("/media/a_transcoded.mp4"));
    }
}
