//! Core functionality: embedding cache, models, scoring, search and filtering

/// Time-bounded embedding cache.
pub mod cache;
/// Embedding vectors, vision model backends and the shared model handle.
pub mod embeddings;
pub mod filter;
/// Digests used for cache keys.
pub mod hash;
/// Cache-backed embedding retrieval.
pub mod provider;
pub mod resolver;
pub mod search;
/// Cosine similarity and percentage scoring.
pub mod similarity;
