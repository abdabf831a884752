use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use genforge_common::{EnqueueResponse, FailureReport, JobId, JobRequest, KnowledgeEntry};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::{JobError, StoreError};
use crate::jobs::AttemptRecord;
use crate::orchestrator::Orchestrator;
use crate::quality::platforms::{known_platforms, requirements_for};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<AppState>;

// ── Request / response payloads ───────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealingHistory {
    pub job_id: JobId,
    pub attempts: Vec<AttemptRecord>,
    pub report: Option<FailureReport>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
            StoreError::Conflict { .. } => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for ApiError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Store(e) => e.into(),
            JobError::Cancelled(_) => ApiError::Conflict(err.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/jobs", get(list_jobs).post(enqueue_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/cancel", post(cancel_job))
        .route("/api/jobs/{id}/healing", get(get_healing_history))
        .route("/api/knowledge", get(list_knowledge))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn enqueue_job(
    State(state): State<SharedState>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(ref platform) = request.platform {
        if requirements_for(platform).is_none() {
            return Err(ApiError::BadRequest(format!(
                "Unknown platform '{}'. Known platforms: {}",
                platform,
                known_platforms().join(", ")
            )));
        }
    }
    if request
        .phases
        .as_ref()
        .is_some_and(|phases| phases.iter().any(|p| p.trim().is_empty()))
    {
        return Err(ApiError::BadRequest("Phase names must not be empty".into()));
    }

    let record = state.orchestrator.submit(request).await?;
    Ok((
        StatusCode::CREATED,
        Json(EnqueueResponse { job_id: record.id }),
    ))
}

async fn list_jobs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.orchestrator.store().list(limit).await?;
    Ok(Json(jobs))
}

async fn get_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.store().fetch(&JobId::from(id)).await?;
    Ok(Json(record))
}

async fn cancel_job(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let record = state.orchestrator.cancel(&JobId::from(id)).await?;
    Ok(Json(record))
}

async fn get_healing_history(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job_id = JobId::from(id);
    let store = state.orchestrator.store();
    // 404 for unknown jobs rather than an empty history.
    store.fetch(&job_id).await?;
    let attempts = store.healing_attempts(&job_id).await?;
    let report = store.latest_failure_report(&job_id).await?;
    Ok(Json(HealingHistory {
        job_id,
        attempts,
        report,
    }))
}

async fn list_knowledge(State(state): State<SharedState>) -> Json<Vec<KnowledgeEntry>> {
    Json(state.orchestrator.healing().knowledge().entries())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ProgressChannel;
    use crate::healing::checkpoint::MemoryCheckpoints;
    use crate::healing::knowledge::KnowledgeBase;
    use crate::healing::signature::signature_for;
    use crate::healing::test_support::RecordingToolkit;
    use crate::healing::{HealingEngine, HealingSettings};
    use crate::jobs::JobStore;
    use crate::orchestrator::OrchestratorSettings;
    use crate::pipeline::test_support::ScriptedExecutor;
    use crate::quality::{PASS_THRESHOLD, QualityGate};
    use axum::body::Body;
    use axum::http::Request;
    use genforge_common::{JobRecord, JobStatus, StrategyKind};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state() -> SharedState {
        let store = JobStore::in_memory().unwrap();
        let channel = Arc::new(ProgressChannel::default());
        let healing = Arc::new(HealingEngine::new(
            HealingSettings::default(),
            store.clone(),
            channel.clone(),
            Arc::new(KnowledgeBase::in_memory()),
            Arc::new(MemoryCheckpoints::default()),
            Arc::new(RecordingToolkit::fixing(&[])),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            channel,
            Arc::new(ScriptedExecutor::default()),
            Arc::new(QualityGate::new(PASS_THRESHOLD).unwrap()),
            healing,
            OrchestratorSettings::default(),
        ));
        Arc::new(AppState { orchestrator })
    }

    fn test_app(state: SharedState) -> Router {
        api_router().with_state(state)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(body: Body) -> T {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let response = test_app(test_state()).oneshot(get("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_enqueue_then_fetch() {
        let state = test_state();
        let response = test_app(state.clone())
            .oneshot(post_json(
                "/api/jobs",
                serde_json::json!({"request": {"prompt": "todo app"}, "session_id": "s-1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body: serde_json::Value = body_json(response.into_body()).await;
        let job_id = body["jobId"].as_str().unwrap().to_string();

        let response = test_app(state)
            .oneshot(get(&format!("/api/jobs/{}", job_id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record: JobRecord = body_json(response.into_body()).await;
        assert_eq!(record.id.as_str(), job_id);
        assert_eq!(record.session_id.as_deref(), Some("s-1"));
        assert_eq!(record.request["prompt"], "todo app");
    }

    #[tokio::test]
    async fn test_enqueue_unknown_platform_is_bad_request() {
        let response = test_app(test_state())
            .oneshot(post_json("/api/jobs", serde_json::json!({"platform": "cobol"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = body_json(response.into_body()).await;
        assert!(body["error"].as_str().unwrap().contains("cobol"));
    }

    #[tokio::test]
    async fn test_get_missing_job_is_not_found() {
        let response = test_app(test_state())
            .oneshot(get("/api/jobs/does-not-exist"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_settled_job_is_conflict() {
        let state = test_state();
        let store = state.orchestrator.store().clone();
        let job = store.enqueue(JobRequest::default()).await.unwrap();
        store.cancel(&job.id).await.unwrap();

        let response = test_app(state)
            .oneshot(post_json(&format!("/api/jobs/{}/cancel", job.id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_cancel_queued_job() {
        let state = test_state();
        let job = state
            .orchestrator
            .store()
            .enqueue(JobRequest::default())
            .await
            .unwrap();

        let response = test_app(state)
            .oneshot(post_json(&format!("/api/jobs/{}/cancel", job.id), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let record: JobRecord = body_json(response.into_body()).await;
        assert_eq!(record.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_list_jobs_respects_limit() {
        let state = test_state();
        for _ in 0..3 {
            state
                .orchestrator
                .store()
                .enqueue(JobRequest::default())
                .await
                .unwrap();
        }
        let response = test_app(state)
            .oneshot(get("/api/jobs?limit=2"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let jobs: Vec<JobRecord> = body_json(response.into_body()).await;
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_healing_history_for_unknown_job_is_not_found() {
        let response = test_app(test_state())
            .oneshot(get("/api/jobs/ghost/healing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_healing_history_empty_for_clean_job() {
        let state = test_state();
        let job = state
            .orchestrator
            .store()
            .enqueue(JobRequest::default())
            .await
            .unwrap();
        let response = test_app(state)
            .oneshot(get(&format!("/api/jobs/{}/healing", job.id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let history: HealingHistory = body_json(response.into_body()).await;
        assert!(history.attempts.is_empty());
        assert!(history.report.is_none());
    }

    #[tokio::test]
    async fn test_knowledge_lists_entries() {
        let state = test_state();
        state
            .orchestrator
            .healing()
            .knowledge()
            .record_success(&signature_for("module not found"), StrategyKind::ContextFix);

        let response = test_app(state).oneshot(get("/api/knowledge")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let entries: Vec<KnowledgeEntry> = body_json(response.into_body()).await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].strategy, StrategyKind::ContextFix);
        assert_eq!(entries[0].successes, 1);
    }
}
