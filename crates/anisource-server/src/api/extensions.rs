//! Installed extension management endpoints.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anisource_extensions::{ExtensionError, InstalledExtension};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{api_error, bad_request, ApiError, AppState};

// ─── Request / Response types ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub repo_url: String,
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct InstallFileRequest {
    pub path: PathBuf,
}

#[derive(Debug, Serialize)]
pub struct ExtensionListResponse {
    pub extensions: Vec<InstalledExtension>,
}

#[derive(Debug, Serialize)]
pub struct UpdatesResponse {
    pub updates: HashMap<String, String>,
}

// ─── Handlers ───────────────────────────────────────────────────────────

/// GET /api/extensions
pub async fn list_extensions(State(state): State<Arc<AppState>>) -> Json<ExtensionListResponse> {
    Json(ExtensionListResponse {
        extensions: state.manager.get_extensions().await,
    })
}

/// GET /api/extensions/{id}
pub async fn get_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InstalledExtension>, ApiError> {
    state
        .manager
        .get_extension(&id)
        .await
        .map(Json)
        .ok_or_else(|| api_error(ExtensionError::NotFound(id)))
}

/// POST /api/extensions/install
pub async fn install_extension(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallRequest>,
) -> Result<(StatusCode, Json<InstalledExtension>), ApiError> {
    if body.repo_url.trim().is_empty() || body.id.trim().is_empty() {
        return Err(bad_request("repoUrl and id are required"));
    }
    let entry = state
        .manager
        .install_from_repository(&body.repo_url, &body.id)
        .await
        .map_err(|e| {
            tracing::warn!(repo_url = %body.repo_url, extension_id = %body.id, "extension installation failed: {e}");
            api_error(e)
        })?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// POST /api/extensions/install-file
pub async fn install_extension_file(
    State(state): State<Arc<AppState>>,
    Json(body): Json<InstallFileRequest>,
) -> Result<(StatusCode, Json<InstalledExtension>), ApiError> {
    let entry = state
        .manager
        .install_from_file(&body.path)
        .await
        .map_err(|e| {
            tracing::warn!(path = %body.path.display(), "extension installation failed: {e}");
            api_error(e)
        })?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// DELETE /api/extensions/{id}
pub async fn uninstall_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .uninstall_extension(&id)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/extensions/{id}/enable
pub async fn enable_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.manager.enable_extension(&id).await.map_err(api_error)?;
    Ok(Json(serde_json::json!({ "id": id, "state": "enabled" })))
}

/// POST /api/extensions/{id}/disable
pub async fn disable_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state
        .manager
        .disable_extension(&id)
        .await
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "id": id, "state": "disabled" })))
}

/// POST /api/extensions/{id}/update
pub async fn update_extension(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<InstalledExtension>, ApiError> {
    state
        .manager
        .update_extension(&id)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/extensions/updates
pub async fn check_updates(State(state): State<Arc<AppState>>) -> Json<UpdatesResponse> {
    Json(UpdatesResponse {
        updates: state.manager.check_updates().await,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, app_with, send, FOX};
    use axum::http::StatusCode;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_list_and_get_extension() {
        let t = app().await;
        let (status, body) = send(&t.app, "GET", "/api/extensions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["extensions"][0]["info"]["id"], "com.example.fox");
        assert_eq!(body["extensions"][0]["state"], "enabled");

        let (status, body) = send(&t.app, "GET", "/api/extensions/com.example.fox", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["info"]["hasSearch"], true);

        let (status, body) = send(&t.app, "GET", "/api/extensions/ghost", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_disable_then_enable() {
        let t = app().await;
        let (status, body) =
            send(&t.app, "POST", "/api/extensions/com.example.fox/disable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "disabled");
        assert!(t.state.manager.get_enabled_sources().await.is_empty());

        let (status, _) =
            send(&t.app, "POST", "/api/extensions/com.example.fox/enable", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.state.manager.get_enabled_sources().await.len(), 1);
    }

    #[tokio::test]
    async fn test_enable_broken_extension_is_bad_request() {
        let t = app_with(
            "https://repo.example/index.json",
            &[("broken.lua", "Extension = {")],
        )
        .await;
        let (status, _) = send(&t.app, "POST", "/api/extensions/broken/enable", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_uninstall() {
        let t = app().await;
        let (status, _) = send(&t.app, "DELETE", "/api/extensions/com.example.fox", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = send(&t.app, "DELETE", "/api/extensions/com.example.fox", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_install_requires_fields() {
        let t = app().await;
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/extensions/install",
            Some(json!({ "repoUrl": "", "id": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_install_from_unreachable_repository_is_bad_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let t = app().await;
        let (status, _) = send(
            &t.app,
            "POST",
            "/api/extensions/install",
            Some(json!({ "repoUrl": format!("{}/index.json", server.uri()), "id": "com.example.owl" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(t.state.manager.get_extension("com.example.owl").await.is_none());
    }

    #[tokio::test]
    async fn test_install_file() {
        let t = app_with("https://repo.example/index.json", &[]).await;
        let script = t.dir.path().join("fox.lua");
        std::fs::write(&script, FOX).unwrap();

        let (status, body) = send(
            &t.app,
            "POST",
            "/api/extensions/install-file",
            Some(json!({ "path": script })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["info"]["id"], "com.example.fox");

        let broken = t.dir.path().join("broken.lua");
        std::fs::write(&broken, "Extension = { name = 'no id' }").unwrap();
        let (status, body) = send(
            &t.app,
            "POST",
            "/api/extensions/install-file",
            Some(json!({ "path": broken })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("id"));
    }

    #[tokio::test]
    async fn test_check_updates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "version": 1,
                "extensions": [{
                    "id": "com.example.fox", "name": "Fox", "version": "2.0.0",
                    "scriptUrl": format!("{}/fox.lua", server.uri()),
                }],
            })))
            .mount(&server)
            .await;

        let t = app_with(&format!("{}/index.json", server.uri()), &[("fox.lua", FOX)]).await;
        let (status, body) = send(&t.app, "GET", "/api/extensions/updates", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["updates"]["com.example.fox"], "2.0.0");
    }
}
