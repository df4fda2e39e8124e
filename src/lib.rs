#![doc(html_root_url = "https://docs.rs/visimatch/0.1.0")]
#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

//! # Visimatch
//!
//! Visual product matching: given a reference image, rank a fixed product
//! catalog by how similar each product photo looks, using embeddings from a
//! vision model.
//!
//! ## Features
//!
//! - **Embedding Cache**: process-wide, TTL-bounded cache of image embeddings with a background sweeper
//! - **Embedding Provider**: cache-first retrieval over a lazily loaded, shared vision model
//! - **Similarity Scoring**: cosine similarity mapped onto a 0-100 percentage
//! - **Search**: bounded-concurrency catalog scan with progress reporting and per-item failure tolerance
//! - **Filtering**: similarity, category and price controls over ranked results
//! - **Web API**: HTTP server exposing search, progress, filtering and cache management
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use visimatch::{
//!     Catalog, EmbeddingCache, EmbeddingProvider, HistogramLoader, ImageReference,
//!     ImageResolver, ModelHandle, SearchConfig, SearchOrchestrator,
//! };
//!
//! # async fn run() -> visimatch::Result<()> {
//! let catalog = Catalog::load("data/products.json")?;
//! let provider = Arc::new(EmbeddingProvider::new(
//!     Arc::new(ModelHandle::new(Arc::new(HistogramLoader))),
//!     Arc::new(EmbeddingCache::new(Duration::from_secs(3600))),
//!     ImageResolver::default(),
//! ));
//! let orchestrator = SearchOrchestrator::new(provider, SearchConfig::default());
//!
//! let query = ImageReference::new("https://example.com/shoe.jpg");
//! let outcome = orchestrator
//!     .search(&query, catalog.items(), |current, total| println!("{}/{}", current, total))
//!     .await?;
//! println!("{} ranked, {} failed", outcome.succeeded, outcome.failed);
//! # Ok(())
//! # }
//! ```

// Internal modules
pub mod api;
pub mod core;
/// Defines the application's error types and result aliases.
pub mod error;
pub mod models;
/// Configuration and shared application state.
pub mod state;
mod utils;

/// Build-time metadata generated by `build.rs`.
#[allow(dead_code, missing_docs, unreachable_pub)]
pub(crate) mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Public API exports
pub use crate::{
    core::{
        cache::{Clock, EmbeddingCache, ManualClock, SystemClock},
        embeddings::{
            Backend, Embedding, HistogramLoader, HistogramModel, ModelHandle, ModelLoader,
            ModelState, VisionModel,
        },
        filter::{filter, CategoryFilter, PriceRange, ResultFilter},
        provider::EmbeddingProvider,
        resolver::ImageResolver,
        search::{SearchConfig, SearchOrchestrator, SearchProgress},
        similarity::score,
    },
    error::{AppError, Result, ResultExt},
    models::{
        catalog::{Catalog, CatalogItem, ImageReference},
        results::{ItemFailure, ScoredItem, SearchOutcome, SearchState},
    },
    state::{AppState, Config},
};

#[cfg(feature = "web")]
pub use crate::api::{create_router, health_check};

#[cfg(feature = "embeddings")]
pub use crate::core::embeddings::{ResnetLoader, ResnetModel};

/// Initialize the application with default settings
///
/// Sets up logging; safe to call more than once.
///
/// # Errors
///
/// Currently infallible; the `Result` leaves room for startup checks.
///
/// # Example
///
/// ```no_run
/// use visimatch::init;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     init()?;
///     // Application code here
///     Ok(())
/// }
/// ```
pub fn init() -> Result<()> {
    // Initialize logging with sensible defaults
    let env = env_logger::Env::default()
        .default_filter_or("info")
        .default_write_style_or("auto");

    let initialized = env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_module_path(false)
        .format_target(false)
        .try_init();

    if initialized.is_ok() {
        log::info!("Initializing Visimatch {}", built_info::PKG_VERSION);
    }
    Ok(())
}
