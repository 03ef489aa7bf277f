use std::net::SocketAddr;
use std::sync::Arc;

use anisource_extensions::{ExtensionManager, HostConfig};
use axum::{http::HeaderValue, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod api;

const DEFAULT_ADDR: &str = "127.0.0.1:8090";

#[derive(Serialize)]
struct ApiStatus {
    status: &'static str,
    version: &'static str,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = HostConfig::from_env();
    tracing::info!(
        data_dir = %config.data_dir.display(),
        app_version = %config.app_version,
        "starting extension host"
    );

    let manager = ExtensionManager::new(config).expect("failed to build extension manager");
    manager
        .initialize()
        .await
        .expect("failed to initialize extensions");

    let state = Arc::new(api::AppState { manager });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api::router())
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer())
        .with_state(state.clone());

    let addr: SocketAddr = std::env::var("EXTENSION_HOST_ADDR")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| DEFAULT_ADDR.parse().expect("valid default address"));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind listener");
    tracing::info!(%addr, "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    state.manager.shutdown().await;
    tracing::info!("server stopped");
}

/// Cross-origin access is limited to `CORS_ORIGINS` (comma separated).
fn cors_layer() -> CorsLayer {
    let origins: Vec<HeaderValue> = std::env::var("CORS_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| HeaderValue::from_str(s.trim()).ok())
        .filter(|v| !v.is_empty())
        .collect();
    if origins.is_empty() {
        tracing::warn!("CORS_ORIGINS not set, cross-origin requests are rejected");
        return CorsLayer::new();
    }
    tracing::info!("CORS allowed origins: {:?}", origins);
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::DELETE,
            axum::http::Method::OPTIONS,
        ])
        .allow_headers(tower_http::cors::Any)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
}

async fn healthz() -> Json<ApiStatus> {
    Json(ApiStatus {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
