//! Content endpoints proxied to an extension's script.

use std::collections::HashMap;
use std::sync::Arc;

use anisource_extensions::{
    AnimeDetails, AnimePage, Episode, ExtensionError, ExtensionInfo, ExtensionSource,
    SearchFilters, VideoSource,
};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{api_error, bad_request, ApiError, AppState};

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UrlQuery {
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SourcesQuery {
    pub lang: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<ExtensionInfo>,
}

fn page_number(page: Option<u32>) -> u32 {
    page.unwrap_or(1).max(1)
}

fn required_url(query: UrlQuery) -> Result<String, ApiError> {
    match query.url {
        Some(url) if !url.trim().is_empty() => Ok(url),
        _ => Err(bad_request("url query parameter is required")),
    }
}

/// GET /api/sources?lang=
pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SourcesQuery>,
) -> Json<SourcesResponse> {
    let sources = match query.lang.as_deref().filter(|l| !l.is_empty()) {
        Some(lang) => state.manager.get_sources_by_language(lang).await,
        None => state.manager.get_enabled_sources().await,
    };
    Json(SourcesResponse {
        sources: sources.iter().map(|s| s.info().clone()).collect(),
    })
}

/// GET /api/extensions/{id}/search?q=&page=
///
/// Every other query parameter is passed to the script as a filter.
pub async fn search(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(mut params): Query<HashMap<String, String>>,
) -> Result<Json<AnimePage>, ApiError> {
    let query = params.remove("q").unwrap_or_default();
    let page = match params.remove("page") {
        Some(raw) => page_number(Some(
            raw.parse()
                .map_err(|_| bad_request("page must be a positive integer"))?,
        )),
        None => 1,
    };
    let filters = SearchFilters(params);
    state
        .manager
        .search(&id, &query, page, &filters)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/extensions/{id}/latest?page=
pub async fn latest(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AnimePage>, ApiError> {
    state
        .manager
        .get_latest(&id, page_number(query.page))
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/extensions/{id}/popular?page=
pub async fn popular(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<Json<AnimePage>, ApiError> {
    state
        .manager
        .get_popular(&id, page_number(query.page))
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/extensions/{id}/details?url=
pub async fn details(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<AnimeDetails>, ApiError> {
    let url = required_url(query)?;
    match state.manager.get_anime_details(&id, &url).await {
        Ok(Some(details)) => Ok(Json(details)),
        Ok(None) => Err(api_error(ExtensionError::NotFound(format!(
            "anime at {url}"
        )))),
        Err(e) => Err(api_error(e)),
    }
}

/// GET /api/extensions/{id}/episodes?url=
pub async fn episodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Vec<Episode>>, ApiError> {
    let url = required_url(query)?;
    state
        .manager
        .get_episodes(&id, &url)
        .await
        .map(Json)
        .map_err(api_error)
}

/// GET /api/extensions/{id}/videos?url=
pub async fn videos(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<UrlQuery>,
) -> Result<Json<Vec<VideoSource>>, ApiError> {
    let url = required_url(query)?;
    state
        .manager
        .get_video_sources(&id, &url)
        .await
        .map(Json)
        .map_err(api_error)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{app, app_with, send, FOX};
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_search_passes_query_page_and_filters() {
        let t = app().await;
        let (status, body) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/search?q=naruto&page=1&genre=action",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"][0]["title"], "naruto:action");
        assert_eq!(body["hasNextPage"], true);
    }

    #[tokio::test]
    async fn test_search_rejects_bad_page() {
        let t = app().await;
        let (status, _) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/search?q=x&page=abc",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_latest_and_unsupported_popular() {
        let t = app().await;
        let (status, body) =
            send(&t.app, "GET", "/api/extensions/com.example.fox/latest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["entries"][0]["title"], "latest");
        assert_eq!(body["hasNextPage"], false);

        let (status, body) =
            send(&t.app, "GET", "/api/extensions/com.example.fox/popular?page=2", None).await;
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
        assert!(body["error"].as_str().unwrap().contains("getPopular"));
    }

    #[tokio::test]
    async fn test_details_episodes_and_videos() {
        let t = app().await;
        let (status, body) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/details?url=%2Ffox",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["url"], "/fox");
        assert_eq!(body["genres"][0], "Action");

        let (status, _) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/details?url=%2Fmissing",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/episodes?url=%2Ffox",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["url"], "/fox/1");

        let (status, body) = send(
            &t.app,
            "GET",
            "/api/extensions/com.example.fox/videos?url=%2Ffox%2F1",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["format"], "hls");
    }

    #[tokio::test]
    async fn test_url_is_required() {
        let t = app().await;
        let (status, _) =
            send(&t.app, "GET", "/api/extensions/com.example.fox/episodes", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_extension_is_not_found() {
        let t = app().await;
        let (status, _) = send(&t.app, "GET", "/api/extensions/ghost/latest", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_list_sources_by_language() {
        let pt = FOX
            .replace("com.example.fox", "com.example.raposa")
            .replace("language = \"en\"", "language = \"pt-BR\"");
        let t = app_with(
            "https://repo.example/index.json",
            &[("fox.lua", FOX), ("raposa.lua", pt.as_str())],
        )
        .await;

        let (status, body) = send(&t.app, "GET", "/api/sources", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["sources"].as_array().unwrap().len(), 2);

        let (_, body) = send(&t.app, "GET", "/api/sources?lang=pt-BR", None).await;
        let sources = body["sources"].as_array().unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0]["id"], "com.example.raposa");
    }
}
