use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::core::cache::EmbeddingCache;
use crate::core::embeddings::{Embedding, ModelHandle, ModelState};
use crate::core::resolver::ImageResolver;
use crate::error::{AppError, Result};
use crate::models::catalog::ImageReference;

/// Cache-backed access to image embeddings.
#[derive(Debug)]
pub struct EmbeddingProvider {
    model: Arc<ModelHandle>,
    cache: Arc<EmbeddingCache>,
    resolver: ImageResolver,
    model_calls: AtomicU64,
}

impl EmbeddingProvider {
    /// Creates a provider over an injected model handle, cache and resolver.
    pub fn new(model: Arc<ModelHandle>, cache: Arc<EmbeddingCache>, resolver: ImageResolver) -> Self {
        Self {
            model,
            cache,
            resolver,
            model_calls: AtomicU64::new(0),
        }
    }

    /// The shared cache.
    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    /// Resolver used to fetch image bytes.
    pub fn resolver(&self) -> &ImageResolver {
        &self.resolver
    }

    /// Lifecycle state of the underlying model.
    pub fn model_state(&self) -> ModelState {
        self.model.state()
    }

    /// Loads the model if it isn't loaded yet.
    pub async fn warm_up(&self) -> Result<()> {
        self.model.get().await.map(|_| ())
    }

    /// Number of times the model has been invoked.
    pub fn model_calls(&self) -> u64 {
        self.model_calls.load(Ordering::Relaxed)
    }

    /// Returns the embedding for `reference`.
    ///
    /// A fresh cache entry is returned without touching the model. Otherwise
    /// the image is fetched, decoded and embedded exactly once, and the result
    /// cached. Fails with [`AppError::ModelLoad`] if the model can't be loaded
    /// and [`AppError::EmbeddingFetch`] for anything wrong with this image.
    pub async fn get_embedding(&self, reference: &ImageReference) -> Result<Embedding> {
        if let Some(hit) = self.cache.get(reference) {
            log::debug!("Using cached embedding for {}", reference);
            return Ok(hit);
        }

        let model = self.model.get().await?;
        let bytes = self
            .resolver
            .fetch(reference)
            .await
            .map_err(|e| AppError::embedding_fetch(reference, format!("{:#}", e)))?;

        self.model_calls.fetch_add(1, Ordering::Relaxed);
        let values = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<f32>> {
            let image = image::load_from_memory(&bytes)?;
            model.embed(&image)
        })
        .await?
        .map_err(|e| AppError::embedding_fetch(reference, format!("{:#}", e)))?;

        if values.is_empty() {
            return Err(AppError::embedding_fetch(reference, "model returned an empty vector"));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(AppError::embedding_fetch(reference, "model returned non-finite values"));
        }

        let embedding = Embedding::from(values);
        self.cache.set(reference, embedding.clone());
        Ok(embedding)
    }
}
