//! Time-bounded embedding cache shared by every search in the process.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::core::embeddings::Embedding;
use crate::models::catalog::ImageReference;

/// How long a cached embedding stays valid.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// How often the background sweeper purges expired entries.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Source of "now" for expiry checks.
pub trait Clock: Send + Sync + Debug {
    /// Current monotonic instant.
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Creates a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Embedding,
    created_at: Instant,
}

/// Maps image references to embeddings with lazy expiry.
///
/// Lookups ignore entries older than the TTL without removing them; [`sweep`]
/// reclaims that memory. All operations take the map lock, so a sweep never
/// interleaves with a lookup and a returned embedding is an owned handle that
/// stays usable after the entry is evicted.
///
/// [`sweep`]: EmbeddingCache::sweep
#[derive(Debug)]
pub struct EmbeddingCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl EmbeddingCache {
    /// Creates an empty cache on the system clock.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Creates an empty cache on a caller-supplied clock.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn is_fresh(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) < self.ttl
    }

    /// Returns the cached embedding if present and younger than the TTL.
    pub fn get(&self, reference: &ImageReference) -> Option<Embedding> {
        let now = self.clock.now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&reference.cache_key())
            .filter(|entry| self.is_fresh(entry, now))
            .map(|entry| entry.embedding.clone())
    }

    /// Stores or replaces the embedding for `reference`, stamped with the current time.
    pub fn set(&self, reference: &ImageReference, embedding: Embedding) {
        let entry = CacheEntry {
            embedding,
            created_at: self.clock.now(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.cache_key(), entry);
    }

    /// Removes every expired entry and returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| self.is_fresh(entry, now));
        before - entries.len()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn size(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Spawns a task that sweeps the cache every `every` until aborted.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep();
                if removed > 0 {
                    log::debug!(
                        "Swept {} expired embeddings, {} remain",
                        removed,
                        cache.size()
                    );
                }
            }
        })
    }
}
