//! Ranking a catalog against a query image.

use std::cmp::Reverse;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use uuid::Uuid;

use crate::core::embeddings::Embedding;
use crate::core::provider::EmbeddingProvider;
use crate::core::similarity;
use crate::error::{AppError, Result};
use crate::models::catalog::{CatalogItem, ImageReference};
use crate::models::results::{ItemFailure, ScoredItem, SearchOutcome, SearchState};

/// Tuning for a search run.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Catalog items embedded in parallel. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Deadline for each embedding; an item that misses it fails.
    pub item_timeout: Option<Duration>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            item_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// Shared, observable [`SearchState`].
#[derive(Debug, Clone, Default)]
pub struct SearchProgress {
    state: Arc<RwLock<SearchState>>,
}

impl SearchProgress {
    /// Resets the state for a new search over `total` items.
    pub fn begin(&self, total: usize) {
        *self.write() = SearchState {
            current: 0,
            total,
            busy: true,
        };
    }

    /// Records that `current` of `total` items are done.
    pub fn advance(&self, current: usize, total: usize) {
        let mut state = self.write();
        state.current = current;
        state.total = total;
    }

    /// Marks the search as finished.
    pub fn finish(&self) {
        *self.write() = SearchState::default();
    }

    /// Current state.
    pub fn snapshot(&self) -> SearchState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SearchState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scores every catalog item against a query image.
#[derive(Debug, Clone)]
pub struct SearchOrchestrator {
    provider: Arc<EmbeddingProvider>,
    config: SearchConfig,
}

impl SearchOrchestrator {
    /// Creates an orchestrator over a shared provider.
    pub fn new(provider: Arc<EmbeddingProvider>, config: SearchConfig) -> Self {
        Self { provider, config }
    }

    /// The provider searches run against.
    pub fn provider(&self) -> &Arc<EmbeddingProvider> {
        &self.provider
    }

    /// Ranks `catalog` by similarity to `query`.
    ///
    /// The model is loaded first, outside any item deadline, and a load
    /// failure fails the call with [`AppError::ModelLoad`]. The query is
    /// embedded next; if that fails the whole call fails with
    /// [`AppError::InvalidQueryImage`] before any item is touched. Item failures are counted and logged but never abort
    /// the search. `on_progress(current, total)` fires once per item as it
    /// completes, with `current` running 1..=total. Ranking is by descending
    /// score; ties keep catalog order.
    #[tracing::instrument(level = "debug", skip_all, fields(products = catalog.len()))]
    pub async fn search<F>(
        &self,
        query: &ImageReference,
        catalog: &[CatalogItem],
        mut on_progress: F,
    ) -> Result<SearchOutcome>
    where
        F: FnMut(usize, usize),
    {
        let started = Instant::now();
        let total = catalog.len();
        log::info!("Searching {} products for {}", total, query);

        // a slow first load is not an item timeout, and a failed one is fatal
        // even when every embedding is already cached
        self.provider.warm_up().await?;

        let item_timeout = self.config.item_timeout;
        let query_embedding = match embed(&self.provider, query, item_timeout).await {
            Ok(embedding) => embedding,
            Err(e @ AppError::ModelLoad(_)) => return Err(e),
            Err(AppError::EmbeddingFetch { reason, .. }) => {
                return Err(AppError::InvalidQueryImage(reason))
            }
            Err(e) => return Err(AppError::InvalidQueryImage(e.to_string())),
        };

        let jobs: Vec<(usize, ImageReference)> = catalog
            .iter()
            .map(|item| item.image.clone())
            .enumerate()
            .collect();
        let provider = Arc::clone(&self.provider);
        let mut results = stream::iter(jobs)
            .map(move |(index, image)| {
                let provider = Arc::clone(&provider);
                let query = query_embedding.clone();
                async move { (index, score_item(&provider, &query, &image, item_timeout).await) }
            })
            .buffer_unordered(self.config.concurrency.max(1));

        let mut completed = Vec::with_capacity(total);
        while let Some(result) = results.next().await {
            completed.push(result);
            on_progress(completed.len(), total);
        }

        // back to catalog order so the stable sort below breaks ties by position
        completed.sort_unstable_by_key(|(index, _)| *index);

        let (mut ranked, failures) = completed.into_iter().try_fold(
            (Vec::with_capacity(total), Vec::new()),
            |(mut ranked, mut failures), (index, result)| {
                let item = &catalog[index];
                match result {
                    Ok(score) => ranked.push(ScoredItem::new(item.clone(), score)),
                    Err(e) if e.is_item_failure() => {
                        log::warn!("Failed to process {} (id {}): {}", item.name, item.id, e);
                        failures.push(ItemFailure {
                            item_id: item.id,
                            name: item.name.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => return Err(e),
                }
                Ok((ranked, failures))
            },
        )?;
        ranked.sort_by_key(|scored| Reverse(scored.similarity));

        let cache_size = self.provider.cache().size();
        let outcome = SearchOutcome {
            search_id: Uuid::new_v4(),
            succeeded: ranked.len(),
            failed: failures.len(),
            ranked,
            failures,
            cache_size,
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            completed_at: chrono::Utc::now().to_rfc3339(),
        };

        log::info!(
            "Search complete: analyzed {} products ({} failed) in {} ms, {} cached embeddings",
            outcome.succeeded,
            outcome.failed,
            outcome.elapsed_ms,
            outcome.cache_size
        );
        Ok(outcome)
    }
}

async fn score_item(
    provider: &EmbeddingProvider,
    query: &Embedding,
    image: &ImageReference,
    limit: Option<Duration>,
) -> Result<u8> {
    let candidate = embed(provider, image, limit).await?;
    similarity::score(query, &candidate)
}

async fn embed(
    provider: &EmbeddingProvider,
    reference: &ImageReference,
    limit: Option<Duration>,
) -> Result<Embedding> {
    let fetch = provider.get_embedding(reference);
    match limit {
        Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| {
            AppError::embedding_fetch(reference, format!("timed out after {:?}", limit))
        })?,
        None => fetch.await,
    }
}
