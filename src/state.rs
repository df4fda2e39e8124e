use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::core::cache::{EmbeddingCache, DEFAULT_SWEEP_INTERVAL, DEFAULT_TTL};
use crate::core::embeddings::{HistogramLoader, ModelHandle, ModelLoader};
use crate::core::provider::EmbeddingProvider;
use crate::core::resolver::{ImageResolver, DEFAULT_MAX_IMAGE_BYTES};
use crate::core::search::{SearchConfig, SearchOrchestrator, SearchProgress};
use crate::error::{AppError, Result};
use crate::models::catalog::Catalog;
use crate::models::results::SearchOutcome;

/// Configuration for the application
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the HTTP server binds to
    pub bind_addr: SocketAddr,
    /// Product catalog JSON file
    pub catalog_path: PathBuf,
    /// Directory web paths like `/images/x.jpg` resolve under
    pub image_root: PathBuf,
    /// Maximum upload / fetched image size in bytes
    pub max_image_bytes: usize,
    /// Allowed file extensions for uploads
    pub allowed_extensions: Vec<String>,
    /// Timeout for fetching remote images
    pub fetch_timeout: Duration,
    /// Embedding cache configuration
    pub cache: CacheConfig,
    /// Search tuning
    pub search: SearchConfig,
    /// ResNet weights; uses the colour-histogram model when unset
    pub model_weights: Option<PathBuf>,
}

/// Embedding cache configuration
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Lifetime of a cached embedding
    pub ttl: Duration,
    /// Interval between background sweeps
    pub sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            catalog_path: PathBuf::from("data/products.json"),
            image_root: PathBuf::from("public"),
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            allowed_extensions: vec!["jpg", "jpeg", "png", "webp", "gif"]
                .into_iter()
                .map(String::from)
                .collect(),
            fetch_timeout: Duration::from_secs(20),
            cache: CacheConfig::default(),
            search: SearchConfig::default(),
            model_weights: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

impl Config {
    /// Builds the configuration from defaults overridden by `VISIMATCH_*`
    /// environment variables (a `.env` file is loaded first if present).
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`Config::from_env`] but reads variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("VISIMATCH_BIND_ADDR") {
            config.bind_addr = parse_var("VISIMATCH_BIND_ADDR", &addr)?;
        }
        if let Some(path) = lookup("VISIMATCH_CATALOG") {
            config.catalog_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("VISIMATCH_IMAGE_ROOT") {
            config.image_root = PathBuf::from(path);
        }
        if let Some(bytes) = lookup("VISIMATCH_MAX_IMAGE_BYTES") {
            config.max_image_bytes = parse_var("VISIMATCH_MAX_IMAGE_BYTES", &bytes)?;
        }
        if let Some(secs) = lookup("VISIMATCH_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout = Duration::from_secs(parse_var("VISIMATCH_FETCH_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("VISIMATCH_CACHE_TTL_SECS") {
            config.cache.ttl = Duration::from_secs(parse_var("VISIMATCH_CACHE_TTL_SECS", &secs)?);
        }
        if let Some(secs) = lookup("VISIMATCH_SWEEP_INTERVAL_SECS") {
            let secs: u64 = parse_var("VISIMATCH_SWEEP_INTERVAL_SECS", &secs)?;
            if secs == 0 {
                return Err(AppError::Config(
                    "VISIMATCH_SWEEP_INTERVAL_SECS must be positive".to_string(),
                ));
            }
            config.cache.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(n) = lookup("VISIMATCH_SEARCH_CONCURRENCY") {
            config.search.concurrency = parse_var("VISIMATCH_SEARCH_CONCURRENCY", &n)?;
        }
        if let Some(secs) = lookup("VISIMATCH_ITEM_TIMEOUT_SECS") {
            let secs: u64 = parse_var("VISIMATCH_ITEM_TIMEOUT_SECS", &secs)?;
            config.search.item_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
        if let Some(path) = lookup("VISIMATCH_MODEL_WEIGHTS") {
            config.model_weights = Some(PathBuf::from(path));
        }

        Ok(config)
    }

    /// The model loader this configuration selects.
    pub fn model_loader(&self) -> Result<Arc<dyn ModelLoader>> {
        match &self.model_weights {
            None => Ok(Arc::new(HistogramLoader)),
            #[cfg(feature = "embeddings")]
            Some(weights) => Ok(Arc::new(crate::core::embeddings::ResnetLoader::new(weights.clone()))),
            #[cfg(not(feature = "embeddings"))]
            Some(weights) => Err(AppError::Config(format!(
                "model weights {} given but the `embeddings` feature is disabled",
                weights.display()
            ))),
        }
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{}={:?}: {}", key, value, e)))
}

/// Application state that can be shared across handlers
#[derive(Debug)]
pub struct AppState {
    /// Application configuration
    pub config: Config,
    /// Products searched against
    pub catalog: Catalog,
    /// Search pipeline
    pub orchestrator: SearchOrchestrator,
    /// Progress of the running search
    pub progress: SearchProgress,
    /// Held for the duration of a search; only one runs at a time
    pub search_lock: Mutex<()>,
    last_outcome: RwLock<Option<Arc<SearchOutcome>>>,
}

impl AppState {
    /// Wires the pipeline from a configuration and a loaded catalog
    pub fn new(config: Config, catalog: Catalog) -> Result<Arc<Self>> {
        let loader = config.model_loader()?;
        Ok(Self::with_loader(config, catalog, loader))
    }

    /// Same as [`AppState::new`] with an explicit model loader
    pub fn with_loader(config: Config, catalog: Catalog, loader: Arc<dyn ModelLoader>) -> Arc<Self> {
        let cache = Arc::new(EmbeddingCache::new(config.cache.ttl));
        let resolver = ImageResolver::new(
            config.image_root.clone(),
            config.fetch_timeout,
            config.max_image_bytes,
        );
        let provider = Arc::new(EmbeddingProvider::new(
            Arc::new(ModelHandle::new(loader)),
            cache,
            resolver,
        ));
        let orchestrator = SearchOrchestrator::new(provider, config.search.clone());

        Arc::new(Self {
            config,
            catalog,
            orchestrator,
            progress: SearchProgress::default(),
            search_lock: Mutex::new(()),
            last_outcome: RwLock::new(None),
        })
    }

    /// The embedding cache shared by all searches
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        self.orchestrator.provider().cache()
    }

    /// The most recent completed search
    pub fn last_outcome(&self) -> Option<Arc<SearchOutcome>> {
        self.last_outcome
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Records a completed search
    pub fn store_outcome(&self, outcome: SearchOutcome) -> Arc<SearchOutcome> {
        let outcome = Arc::new(outcome);
        *self.last_outcome.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&outcome));
        outcome
    }
}
