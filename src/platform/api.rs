use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::activity::{ActivityLogger, RequestMeta};
use super::db::{DbHandle, clamp_limit};
use super::models::*;
use super::runtime::ContainerRuntime;
use super::workspace::{ContainerAction, WorkspaceProvisioner};
use super::ws::{WsMessage, WsSender, broadcast_message};
use crate::config::WorkspaceConfig;
use crate::errors::PlatformError;

/// Name reported by `/health`.
pub const SERVICE_NAME: &str = "CloudX Platform";

const DEFAULT_PER_PAGE: i64 = 10;
const MAX_PER_PAGE: i64 = 100;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub ws_tx: WsSender,
    pub provisioner: Arc<WorkspaceProvisioner>,
    pub activity: ActivityLogger,
    /// Key for signing session cookies.
    pub secret_key: Vec<u8>,
    pub started_at: DateTime<Utc>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(
        db: DbHandle,
        runtime: Arc<dyn ContainerRuntime>,
        workspace: WorkspaceConfig,
        secret_key: Vec<u8>,
    ) -> Self {
        let ws_tx = super::ws::channel();
        let provisioner = Arc::new(WorkspaceProvisioner::new(
            runtime,
            db.clone(),
            ws_tx.clone(),
            workspace,
        ));
        Self {
            activity: ActivityLogger::new(db.clone()),
            db,
            ws_tx,
            provisioner,
            secret_key,
            started_at: Utc::now(),
        }
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub per_page: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct DeploymentQuery {
    pub project_id: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CollaboratorRequest {
    pub project_id: i64,
    pub username: String,
}

#[derive(Debug, Deserialize)]
pub struct ContainerActionRequest {
    pub action: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub tail: Option<usize>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    TooManyRequests(String),
    Timeout(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::TooManyRequests(msg) => (StatusCode::TOO_MANY_REQUESTS, msg),
            ApiError::Timeout(msg) => (StatusCode::GATEWAY_TIMEOUT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(json!({"success": false, "error": message}))).into_response()
    }
}

impl From<PlatformError> for ApiError {
    fn from(err: PlatformError) -> Self {
        let msg = err.to_string();
        match err {
            PlatformError::ProjectNotFound { .. } | PlatformError::ContainerNotFound { .. } => {
                ApiError::NotFound(msg)
            }
            PlatformError::InvalidAction { .. } | PlatformError::BadRequest(_) => {
                ApiError::BadRequest(msg)
            }
            PlatformError::LaunchInProgress { .. } => ApiError::Conflict(msg),
            PlatformError::QuotaExceeded { .. } => ApiError::TooManyRequests(msg),
            PlatformError::ReadinessTimeout { .. } => ApiError::Timeout(msg),
            PlatformError::Runtime(_) | PlatformError::Database(_) => {
                error!(kind = err.kind(), error = %msg, "request failed");
                ApiError::Internal(msg)
            }
        }
    }
}

fn db_error(e: anyhow::Error) -> ApiError {
    PlatformError::Database(e).into()
}

/// Unwrap a JSON body, turning extractor rejections into our error shape.
fn parse_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| ApiError::BadRequest(rejection.body_text()))
}

fn require_non_empty(field: &str, value: &str) -> Result<(), ApiError> {
    if value.trim().is_empty() {
        return Err(ApiError::BadRequest(format!("{} is required", field)));
    }
    Ok(())
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/{id}", get(get_project).put(update_project))
        .route("/api/projects/{id}/launch", post(launch_workspace))
        .route("/api/projects/{id}/workspaces", get(list_project_workspaces))
        .route(
            "/api/deployments",
            get(list_deployments).post(create_deployment),
        )
        .route("/api/metrics", get(list_metrics).post(record_metric))
        .route("/api/activities", get(list_activities))
        .route("/api/containers", get(list_containers))
        .route("/api/containers/{id}/action", post(container_action))
        .route("/api/containers/{id}/logs", get(container_logs))
        .route("/create_project", post(create_project_simple))
        .route("/add_collaborator", post(add_collaborator))
        .route("/remove_collaborator", post(remove_collaborator))
        .route("/health", get(health_check))
}

// ── Helpers ───────────────────────────────────────────────────────────

async fn load_project(state: &SharedState, id: i64) -> Result<Project, ApiError> {
    state
        .db
        .get_project(id)
        .await
        .map_err(db_error)?
        .ok_or_else(|| PlatformError::ProjectNotFound { id }.into())
}

async fn insert_project(
    state: &SharedState,
    new: NewProject,
    meta: &RequestMeta,
) -> Result<Project, ApiError> {
    require_non_empty("name", &new.name)?;
    let project = state.db.create_project(&new).await.map_err(db_error)?;
    state
        .activity
        .log(
            "project_created",
            format!("Created project '{}' ({})", project.name, project.id),
            meta,
        )
        .await;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectCreated {
            project: project.clone(),
        },
    );
    Ok(project)
}

async fn publish_collaborators(state: &SharedState, project_id: i64) {
    if let Ok(Some(project)) = state.db.get_project(project_id).await {
        broadcast_message(
            &state.ws_tx,
            &WsMessage::CollaboratorsChanged {
                project_id,
                collaborators: project.collaborators,
            },
        );
    }
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let database = match state.db.ping().await {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {}", e),
    };
    let runtime = if state.provisioner.runtime_reachable().await {
        "ok"
    } else {
        "unreachable"
    };
    let status = if database == "ok" { "healthy" } else { "degraded" };
    Json(json!({
        "status": status,
        "timestamp": Utc::now(),
        "service": SERVICE_NAME,
        "checks": {
            "database": database,
            "container_runtime": runtime,
        },
    }))
}

async fn list_projects(
    State(state): State<SharedState>,
    Query(q): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = q.page.unwrap_or(1).max(1);
    let per_page = q.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let offset = (page - 1).saturating_mul(per_page);

    let projects = state
        .db
        .list_projects(offset, per_page)
        .await
        .map_err(db_error)?;
    let total = state.db.count_projects().await.map_err(db_error)?;

    let page = ProjectPage {
        projects,
        page,
        per_page,
        total,
        pages: ProjectPage::page_count(total, per_page),
    };
    Ok(Json(json!({
        "success": true,
        "projects": page.projects,
        "page": page.page,
        "per_page": page.per_page,
        "total": page.total,
        "pages": page.pages,
    })))
}

async fn create_project(
    State(state): State<SharedState>,
    meta: RequestMeta,
    payload: Result<Json<NewProject>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let new = parse_body(payload)?;
    let project = insert_project(&state, new, &meta).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "project": project})),
    ))
}

async fn get_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let project = load_project(&state, id).await?;
    Ok(Json(json!({"success": true, "project": project})))
}

async fn update_project(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    meta: RequestMeta,
    payload: Result<Json<ProjectUpdate>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let update = parse_body(payload)?;
    if let Some(name) = &update.name {
        require_non_empty("name", name)?;
    }
    let project = state
        .db
        .update_project(id, &update)
        .await
        .map_err(db_error)?
        .ok_or(PlatformError::ProjectNotFound { id })?;

    state
        .activity
        .log("project_updated", format!("Updated project {}", id), &meta)
        .await;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::ProjectUpdated {
            project: project.clone(),
        },
    );
    Ok(Json(json!({"success": true, "project": project})))
}

async fn launch_workspace(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    meta: RequestMeta,
) -> Result<impl IntoResponse, ApiError> {
    let session = state.provisioner.launch(id, &meta).await?;
    Ok(Json(json!({
        "success": true,
        "container_id": session.workspace.container_id,
        "container_name": session.workspace.container_name,
        "editor_url": session.editor_url,
        "ssh_command": session.ssh_command,
        "password": session.password,
        "workspace": session.workspace,
    })))
}

async fn list_project_workspaces(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    load_project(&state, id).await?;
    let workspaces = state
        .db
        .list_workspaces(Some(id))
        .await
        .map_err(db_error)?;
    Ok(Json(json!({"success": true, "workspaces": workspaces})))
}

async fn list_deployments(
    State(state): State<SharedState>,
    Query(q): Query<DeploymentQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let deployments = state
        .db
        .list_deployments(q.project_id, clamp_limit(q.limit))
        .await
        .map_err(db_error)?;
    Ok(Json(json!({"success": true, "deployments": deployments})))
}

async fn create_deployment(
    State(state): State<SharedState>,
    meta: RequestMeta,
    payload: Result<Json<NewDeployment>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let new = parse_body(payload)?;
    require_non_empty("environment", &new.environment)?;
    load_project(&state, new.project_id).await?;

    let deployment = state.db.create_deployment(&new).await.map_err(db_error)?;
    state
        .activity
        .log(
            "deployment_created",
            format!(
                "Deployment {} of project {} to {}",
                deployment.id, deployment.project_id, deployment.environment
            ),
            &meta,
        )
        .await;
    broadcast_message(
        &state.ws_tx,
        &WsMessage::DeploymentCreated {
            deployment: deployment.clone(),
        },
    );
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "deployment": deployment})),
    ))
}

async fn list_metrics(
    State(state): State<SharedState>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let metrics = state
        .db
        .list_metrics(clamp_limit(q.limit))
        .await
        .map_err(db_error)?;
    Ok(Json(json!({"success": true, "metrics": metrics})))
}

async fn record_metric(
    State(state): State<SharedState>,
    payload: Result<Json<NewMetric>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let new = parse_body(payload)?;
    require_non_empty("metric_name", &new.metric_name)?;
    if !new.metric_value.is_finite() {
        return Err(ApiError::BadRequest(
            "metric_value must be a finite number".to_string(),
        ));
    }
    let metric = state.db.record_metric(&new).await.map_err(db_error)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"success": true, "metric": metric})),
    ))
}

async fn list_activities(
    State(state): State<SharedState>,
    Query(q): Query<LimitQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let activities = state
        .db
        .list_activities(clamp_limit(q.limit))
        .await
        .map_err(db_error)?;
    Ok(Json(json!({"success": true, "activities": activities})))
}

async fn list_containers(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let containers = state.provisioner.list_containers().await?;
    Ok(Json(json!({"success": true, "containers": containers})))
}

async fn container_action(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    meta: RequestMeta,
    payload: Result<Json<ContainerActionRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    let action: ContainerAction = req.action.parse()?;
    state.provisioner.container_action(&id, action, &meta).await?;
    Ok(Json(json!({
        "success": true,
        "message": format!("Container {} {}", id, action.past_tense()),
    })))
}

async fn container_logs(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let logs = state.provisioner.container_logs(&id, q.tail).await?;
    Ok(Json(json!({"success": true, "logs": logs})))
}

async fn create_project_simple(
    State(state): State<SharedState>,
    meta: RequestMeta,
    payload: Result<Json<NewProject>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let new = parse_body(payload)?;
    let project = insert_project(&state, new, &meta).await?;
    Ok((StatusCode::CREATED, Json(json!({"project_id": project.id}))))
}

async fn add_collaborator(
    State(state): State<SharedState>,
    meta: RequestMeta,
    payload: Result<Json<CollaboratorRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    require_non_empty("username", &req.username)?;
    let success = state
        .db
        .add_collaborator(req.project_id, &req.username)
        .await
        .map_err(db_error)?;
    if success {
        state
            .activity
            .log(
                "collaborator_added",
                format!("Added {} to project {}", req.username, req.project_id),
                &meta,
            )
            .await;
        publish_collaborators(&state, req.project_id).await;
    }
    Ok(Json(json!({"success": success})))
}

async fn remove_collaborator(
    State(state): State<SharedState>,
    meta: RequestMeta,
    payload: Result<Json<CollaboratorRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let req = parse_body(payload)?;
    require_non_empty("username", &req.username)?;
    let success = state
        .db
        .remove_collaborator(req.project_id, &req.username)
        .await
        .map_err(db_error)?;
    if success {
        state
            .activity
            .log(
                "collaborator_removed",
                format!("Removed {} from project {}", req.username, req.project_id),
                &meta,
            )
            .await;
        publish_collaborators(&state, req.project_id).await;
    }
    Ok(Json(json!({"success": success})))
}

// ── Tests ─────────────────────────────────────────────────────────────
