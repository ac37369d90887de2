//! JSON API for submitting and inspecting prospecting jobs.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use prospector_core::{
    ActorId, JobKey, JobStatus, NewProspectJob, ProspectEvent, ProspectFilters, ProspectJob,
    TenantId,
};
use prospector_pipeline::{
    CancelOutcome, JobListFilter, JobStore, JobSubmitter, PipelineError, StoreError, WorkerConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "prospector-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub submitter: JobSubmitter,
}

impl AppState {
    pub fn new(store: Arc<dyn JobStore>, config: &WorkerConfig) -> Self {
        Self {
            submitter: JobSubmitter::new(store.clone(), config),
            store,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubmitJobRequest {
    pub actor_id: ActorId,
    pub prompt: String,
    pub size: i32,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub filters: ProspectFilters,
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    status: Option<String>,
    actor_id: Option<ActorId>,
    created_after: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    since: Option<DateTime<Utc>>,
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct JobList {
    jobs: Vec<ProspectJob>,
}

#[derive(Debug, Serialize)]
struct EventList {
    events: Vec<ProspectEvent>,
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound,
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "job not found".to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "job store failure");
        ApiError::Internal("job store unavailable".to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Invalid(msg) => ApiError::BadRequest(msg),
            quota @ PipelineError::QuotaExceeded { .. } => ApiError::TooManyRequests(quota.to_string()),
            PipelineError::Store(err) => err.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route(
            "/tenants/{tenant_id}/jobs",
            post(submit_job_handler).get(list_jobs_handler),
        )
        .route("/tenants/{tenant_id}/jobs/{job_id}", get(get_job_handler))
        .route("/tenants/{tenant_id}/jobs/{job_id}/events", get(list_events_handler))
        .route("/tenants/{tenant_id}/jobs/{job_id}/cancel", post(cancel_job_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();
    let store = prospector_pipeline::connect_store(&config).await?;
    let state = AppState::new(store, &config);
    let listener = TcpListener::bind(&config.bind).await?;
    info!(bind = %config.bind, "prospector web listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn healthz_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn submit_job_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<TenantId>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<ProspectJob>), ApiError> {
    let job = state
        .submitter
        .submit(NewProspectJob {
            tenant_id,
            actor_id: body.actor_id,
            prompt: body.prompt,
            size: body.size,
            providers: body.providers,
            filters: body.filters,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs_handler(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<TenantId>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobList>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(format!("status: {e}")))?;
    let filter = JobListFilter {
        status,
        actor_id: query.actor_id,
        created_after: query.created_after,
        limit: query.limit.unwrap_or(50),
    };
    let jobs = state.store.list_jobs(tenant_id, &filter).await?;
    Ok(Json(JobList { jobs }))
}

async fn get_job_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, job_id)): Path<(TenantId, Uuid)>,
) -> Result<Json<ProspectJob>, ApiError> {
    state
        .store
        .get_job(JobKey::new(tenant_id, job_id))
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

async fn list_events_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, job_id)): Path<(TenantId, Uuid)>,
    Query(query): Query<EventsQuery>,
) -> Result<Json<EventList>, ApiError> {
    let key = JobKey::new(tenant_id, job_id);
    if state.store.get_job(key).await?.is_none() {
        return Err(ApiError::NotFound);
    }
    let events = state
        .store
        .list_events(key, query.since, query.limit.unwrap_or(200))
        .await?;
    Ok(Json(EventList { events }))
}

async fn cancel_job_handler(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, job_id)): Path<(TenantId, Uuid)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match state.store.cancel_job(JobKey::new(tenant_id, job_id)).await? {
        CancelOutcome::Canceled => Ok(Json(json!({ "status": JobStatus::Canceled }))),
        CancelOutcome::NotCancelable(status) => Err(ApiError::Conflict(format!(
            "job is {status} and can no longer be canceled"
        ))),
        CancelOutcome::NotFound => Err(ApiError::NotFound),
    }
}
