//! API module for handling HTTP requests and responses

#[cfg(feature = "web")]
pub(crate) mod handlers;
#[cfg(feature = "web")]
pub(crate) mod responses;

#[cfg(feature = "web")]
use axum::{
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Router,
};
#[cfg(feature = "web")]
use serde_json::json;
#[cfg(feature = "web")]
use std::sync::Arc;
#[cfg(feature = "web")]
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
    trace::TraceLayer,
};
#[cfg(feature = "web")]
use crate::state::AppState;

#[cfg(feature = "web")]
pub(crate) use handlers::*;

#[cfg(feature = "web")]
/// Create the application router with all routes
///
/// `max_body_bytes` bounds request bodies; JSON searches carry the image as a
/// base64 data URI, so it should comfortably exceed the largest image.
pub fn create_router(max_body_bytes: usize) -> Router<Arc<AppState>> {
    // Configure CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/catalog", get(catalog))
        .route("/api/search", post(search))
        .route("/api/search/upload", post(search_upload))
        .route("/api/search/progress", get(search_progress))
        .route("/api/results", get(filter_results))
        .route("/api/cache", get(cache_info))
        .route("/api/cache/clear", post(clear_cache))
        .route("/api/model/load", post(load_model))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

#[cfg(feature = "web")]
/// Health check endpoint
pub async fn health_check(State(state): State<Arc<AppState>>) -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "status": "ok",
        "version": crate::built_info::PKG_VERSION,
        "model": state.orchestrator.provider().model_state(),
        "catalog_size": state.catalog.len(),
        "cache_size": state.cache().size(),
    }))
}
