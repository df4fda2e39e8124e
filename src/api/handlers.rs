use axum::{
    extract::{Multipart, Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::{
    core::filter::{CategoryFilter, PriceRange, ResultFilter, DEFAULT_MIN_SIMILARITY},
    core::search::SearchProgress,
    error::{AppError, Result},
    models::catalog::{Catalog, ImageReference},
    models::results::{ScoredItem, SearchOutcome},
    utils::{upload_to_data_uri, validate_file_extension},
    AppState,
};

use super::responses::ApiResponse;

/// Filter controls; anything omitted falls back to the catalog defaults.
#[derive(Debug, Default, Deserialize)]
pub struct FilterParams {
    pub min_similarity: Option<u8>,
    pub category: Option<String>,
    pub price_min: Option<f64>,
    pub price_max: Option<f64>,
}

impl FilterParams {
    fn resolve(&self, catalog: &Catalog) -> Result<ResultFilter> {
        let bounds = catalog.price_bounds();
        let price_range = PriceRange::new(
            self.price_min.unwrap_or(bounds.min),
            self.price_max.unwrap_or(bounds.max),
        )?;
        let category = self
            .category
            .as_deref()
            .map(CategoryFilter::from)
            .unwrap_or_default();

        ResultFilter::new(
            self.min_similarity.unwrap_or(DEFAULT_MIN_SIMILARITY),
            category,
            price_range,
        )
    }

    fn set(&mut self, name: &str, value: &str) -> Result<()> {
        let invalid = |e: &dyn std::fmt::Display| AppError::InvalidInput(format!("{}: {}", name, e));
        match name {
            "min_similarity" => self.min_similarity = Some(value.parse().map_err(|e| invalid(&e))?),
            "category" => self.category = Some(value.to_string()),
            "price_min" => self.price_min = Some(value.parse().map_err(|e| invalid(&e))?),
            "price_max" => self.price_max = Some(value.parse().map_err(|e| invalid(&e))?),
            _ => {}
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    /// URL, web path or data URI of the query image
    pub image: String,
    #[serde(flatten)]
    pub filter: FilterParams,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    #[serde(flatten)]
    pub outcome: Arc<SearchOutcome>,
    /// Ranked items that pass the filter controls
    pub displayed: Vec<ScoredItem>,
}

/// Resets the shared progress when dropped, including when the client
/// disconnects and the handler future is dropped mid-search.
struct ProgressGuard<'a>(&'a SearchProgress);

impl Drop for ProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.finish();
    }
}

async fn run_search(state: &AppState, query: ImageReference, params: &FilterParams) -> Result<SearchResponse> {
    let filter = params.resolve(&state.catalog)?;
    state
        .orchestrator
        .provider()
        .resolver()
        .ensure_public(&query)
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let _guard = state
        .search_lock
        .try_lock()
        .map_err(|_| AppError::Busy("a search is already running".to_string()))?;

    let items = state.catalog.items();
    state.progress.begin(items.len());
    let progress = ProgressGuard(&state.progress);
    let result = state
        .orchestrator
        .search(&query, items, |current, total| state.progress.advance(current, total))
        .await;
    drop(progress);

    let outcome = state.store_outcome(result?);
    let displayed = filter.apply(&outcome.ranked);
    Ok(SearchResponse { outcome, displayed })
}

pub async fn search(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> Result<impl IntoResponse> {
    if request.image.trim().is_empty() {
        return Err(AppError::InvalidInput("image is required".to_string()));
    }

    let response = run_search(&state, ImageReference::new(request.image), &request.filter).await?;
    Ok(ApiResponse::success(response))
}

pub async fn search_upload(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse> {
    let mut query = None;
    let mut params = FilterParams::default();

    // Process the multipart form data
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or("").to_string();

        if name == "file" {
            let file_name = field
                .file_name()
                .ok_or_else(|| AppError::Upload("No filename provided".to_string()))?
                .to_string();

            if !validate_file_extension(&file_name, &state.config.allowed_extensions) {
                return Err(AppError::Upload(format!("Unsupported file type: {}", file_name)));
            }

            let content = field.bytes().await?;
            if content.len() > state.config.max_image_bytes {
                return Err(AppError::Upload(format!(
                    "File is {} bytes, limit is {}",
                    content.len(),
                    state.config.max_image_bytes
                )));
            }

            log::debug!("Received upload {} ({} bytes)", file_name, content.len());
            query = Some(ImageReference::new(upload_to_data_uri(&file_name, &content)));
        } else {
            let value = field.text().await?;
            params.set(&name, &value)?;
        }
    }

    let query = query.ok_or_else(|| AppError::Upload("No file provided".to_string()))?;
    let response = run_search(&state, query, &params).await?;
    Ok(ApiResponse::success(response))
}

pub async fn search_progress(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let progress = state.progress.snapshot();
    ApiResponse::success(json!({
        "current": progress.current,
        "total": progress.total,
        "busy": progress.busy,
        "percent": progress.percent(),
    }))
}

pub async fn filter_results(
    State(state): State<Arc<AppState>>,
    Query(params): Query<FilterParams>,
) -> Result<impl IntoResponse> {
    let outcome = state
        .last_outcome()
        .ok_or_else(|| AppError::NotFound("no search has completed yet".to_string()))?;
    let filter = params.resolve(&state.catalog)?;

    Ok(ApiResponse::success(SearchResponse {
        displayed: filter.apply(&outcome.ranked),
        outcome,
    }))
}

pub async fn catalog(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ApiResponse::success(json!({
        "items": state.catalog.items(),
        "categories": state.catalog.categories(),
        "price_bounds": state.catalog.price_bounds(),
    }))
}

pub async fn cache_info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache();
    ApiResponse::success(json!({
        "size": cache.size(),
        "ttl_secs": cache.ttl().as_secs(),
    }))
}

pub async fn clear_cache(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let cache = state.cache();
    let cleared = cache.size();
    cache.clear();
    log::info!("Cleared {} cached embeddings", cleared);
    ApiResponse::success(json!({ "cleared": cleared }))
}

pub async fn load_model(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    let provider = state.orchestrator.provider();
    provider.warm_up().await?;
    Ok(ApiResponse::success(provider.model_state()))
}
