//! Extension repository endpoints.

use std::sync::Arc;

use anisource_extensions::{RemoteExtension, Repository};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{api_error, bad_request, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct AddRepositoryRequest {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct RepositoryUrlQuery {
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RepositoryListResponse {
    pub repositories: Vec<Repository>,
}

/// A published extension, flagged with local install status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableExtension {
    #[serde(flatten)]
    pub extension: RemoteExtension,
    pub installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_version: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AvailableExtensionsResponse {
    pub extensions: Vec<AvailableExtension>,
}

fn required_url(query: RepositoryUrlQuery) -> Result<String, ApiError> {
    match query.url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(bad_request("url query parameter is required")),
    }
}

/// GET /api/repositories
pub async fn list_repositories(
    State(state): State<Arc<AppState>>,
) -> Json<RepositoryListResponse> {
    Json(RepositoryListResponse {
        repositories: state.manager.get_repositories().await,
    })
}

/// POST /api/repositories
pub async fn add_repository(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AddRepositoryRequest>,
) -> Result<(StatusCode, Json<Repository>), ApiError> {
    let repository = state
        .manager
        .add_repository(&body.name, &body.url)
        .await
        .map_err(api_error)?;
    Ok((StatusCode::CREATED, Json(repository)))
}

/// DELETE /api/repositories?url=
pub async fn remove_repository(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepositoryUrlQuery>,
) -> Result<StatusCode, ApiError> {
    let url = required_url(query)?;
    state
        .manager
        .remove_repository(&url)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/repositories/extensions?url=
pub async fn list_repository_extensions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RepositoryUrlQuery>,
) -> Result<Json<AvailableExtensionsResponse>, ApiError> {
    let url = required_url(query)?;
    let remote = state
        .manager
        .fetch_repository_extensions(&url)
        .await
        .map_err(|e| {
            tracing::warn!(repo_url = %url, "failed to fetch repository index: {e}");
            api_error(e)
        })?;

    let mut extensions = Vec::with_capacity(remote.len());
    for extension in remote {
        let installed_version = state
            .manager
            .get_extension(&extension.id)
            .await
            .map(|e| e.info.version);
        extensions.push(AvailableExtension {
            installed: installed_version.is_some(),
            installed_version,
            extension,
        });
    }
    Ok(Json(AvailableExtensionsResponse { extensions }))
}
