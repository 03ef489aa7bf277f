pub mod extensions;
pub mod repositories;
pub mod sources;

use std::sync::Arc;

use anisource_extensions::{ExtensionError, ExtensionManager};
use axum::{
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};

pub struct AppState {
    pub manager: ExtensionManager,
}

pub type ApiError = (StatusCode, Json<serde_json::Value>);

/// Status code for an extension host error.
pub fn status_for(err: &ExtensionError) -> StatusCode {
    match err {
        ExtensionError::NotFound(_) => StatusCode::NOT_FOUND,
        ExtensionError::Validation(_) => StatusCode::BAD_REQUEST,
        ExtensionError::Parse(_)
        | ExtensionError::MissingMetadata(_)
        | ExtensionError::InvalidMetadata { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        ExtensionError::UnsupportedOperation { .. } => StatusCode::NOT_IMPLEMENTED,
        ExtensionError::Network(_) => StatusCode::BAD_GATEWAY,
        ExtensionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(err: ExtensionError) -> ApiError {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(status = status.as_u16(), "request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
}

pub fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": message })),
    )
}

/// Routes mounted under `/api`.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/extensions", get(extensions::list_extensions))
        .route("/extensions/updates", get(extensions::check_updates))
        .route("/extensions/install", post(extensions::install_extension))
        .route(
            "/extensions/install-file",
            post(extensions::install_extension_file),
        )
        .route(
            "/extensions/{id}",
            get(extensions::get_extension).delete(extensions::uninstall_extension),
        )
        .route("/extensions/{id}/enable", post(extensions::enable_extension))
        .route(
            "/extensions/{id}/disable",
            post(extensions::disable_extension),
        )
        .route("/extensions/{id}/update", post(extensions::update_extension))
        .route("/extensions/{id}/search", get(sources::search))
        .route("/extensions/{id}/latest", get(sources::latest))
        .route("/extensions/{id}/popular", get(sources::popular))
        .route("/extensions/{id}/details", get(sources::details))
        .route("/extensions/{id}/episodes", get(sources::episodes))
        .route("/extensions/{id}/videos", get(sources::videos))
        .route("/sources", get(sources::list_sources))
        .route(
            "/repositories",
            get(repositories::list_repositories)
                .post(repositories::add_repository)
                .delete(repositories::remove_repository),
        )
        .route(
            "/repositories/extensions",
            get(repositories::list_repository_extensions),
        )
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ExtensionError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ExtensionError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ExtensionError::Parse("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ExtensionError::MissingMetadata("id"),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                ExtensionError::UnsupportedOperation {
                    extension: "x".into(),
                    operation: "getPopular",
                },
                StatusCode::NOT_IMPLEMENTED,
            ),
            (ExtensionError::Network("x".into()), StatusCode::BAD_GATEWAY),
            (ExtensionError::Timeout("x".into()), StatusCode::GATEWAY_TIMEOUT),
            (
                ExtensionError::Runtime("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{err}");
        }
    }

    #[test]
    fn test_error_body_shape() {
        let (status, Json(body)) = api_error(ExtensionError::NotFound("com.example.fox".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "not found: com.example.fox");
    }
}
