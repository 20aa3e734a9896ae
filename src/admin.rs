//! Thin admin API for registering repositories and health checks.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;

use crate::store::{Repository, StoreError};
use crate::AppState;

#[derive(Debug, Serialize)]
struct RepositoryDto {
    project_name: String,
    name: String,
    external_repo_id: String,
    enabled: bool,
    last_reconciled_at: Option<DateTime<Utc>>,
}

impl From<Repository> for RepositoryDto {
    fn from(repo: Repository) -> Self {
        Self {
            project_name: repo.project_name,
            name: repo.name,
            external_repo_id: repo.external_repo_id,
            enabled: repo.enabled,
            last_reconciled_at: repo.last_reconciled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddRepositoryRequest {
    project_name: String,
    name: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct SetEnabledRequest {
    enabled: bool,
}

pub fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/repositories", get(list_repositories))
        .route("/repositories", post(add_repository))
        .route(
            "/repositories/{project}/{name}/enabled",
            put(set_repository_enabled),
        )
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "review-balancer"
    }))
}

async fn list_repositories(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<RepositoryDto>>, StatusCode> {
    match state.store.list_repositories().await {
        Ok(repos) => Ok(Json(repos.into_iter().map(RepositoryDto::from).collect())),
        Err(e) => {
            error!(error = %e, "failed to list repositories");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn add_repository(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddRepositoryRequest>,
) -> StatusCode {
    let repo = Repository {
        project_name: request.project_name,
        name: request.name,
        external_repo_id: String::new(),
        enabled: request.enabled,
        last_reconciled_at: None,
    };

    match state.store.add_repository(repo).await {
        Ok(()) => StatusCode::CREATED,
        Err(e) => {
            error!(error = %e, "failed to add repository");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

async fn set_repository_enabled(
    State(state): State<Arc<AppState>>,
    Path((project, name)): Path<(String, String)>,
    Json(request): Json<SetEnabledRequest>,
) -> StatusCode {
    match state
        .store
        .set_repository_enabled(&project, &name, request.enabled)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(StoreError::NotFound) => StatusCode::NOT_FOUND,
        Err(e) => {
            error!(error = %e, "failed to update repository");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
