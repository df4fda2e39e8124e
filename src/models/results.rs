use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::catalog::CatalogItem;

/// A catalog item together with its similarity to the query image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredItem {
    /// The product.
    #[serde(flatten)]
    pub item: CatalogItem,
    /// Similarity percentage in `0..=100`; `None` when scoring failed.
    pub similarity: Option<u8>,
}

impl ScoredItem {
    /// Pairs an item with its score.
    pub fn new(item: CatalogItem, similarity: u8) -> Self {
        Self {
            item,
            similarity: Some(similarity),
        }
    }
}

/// A catalog item that was dropped from the ranking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// Id of the failed product.
    pub item_id: u64,
    /// Name of the failed product.
    pub name: String,
    /// Rendered error.
    pub reason: String,
}

/// Everything a search produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOutcome {
    /// Identifier for this search run.
    pub search_id: Uuid,
    /// Successfully scored items, best match first.
    pub ranked: Vec<ScoredItem>,
    /// Number of items that were scored.
    pub succeeded: usize,
    /// Number of items that were dropped.
    pub failed: usize,
    /// Why each dropped item failed, in catalog order.
    pub failures: Vec<ItemFailure>,
    /// Embedding cache size when the search finished.
    pub cache_size: usize,
    /// Wall-clock duration of the search.
    pub elapsed_ms: u64,
    /// Completion timestamp (RFC 3339).
    pub completed_at: String,
}

/// Progress of the search currently running, if any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchState {
    /// Items processed so far.
    pub current: usize,
    /// Items in the catalog being searched.
    pub total: usize,
    /// Whether a search is running.
    pub busy: bool,
}

impl SearchState {
    /// Fraction of the catalog processed, as a percentage.
    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.current as f64 / self.total as f64 * 100.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::catalog::ImageReference;

    #[test]
    fn test_scored_item_serializes_flat() {
        let item = CatalogItem {
            id: 7,
            name: "Lamp".to_string(),
            category: "Home".to_string(),
            price: 30.0,
            image: ImageReference::new("/images/lamp.jpg"),
        };

        let json = serde_json::to_value(ScoredItem::new(item.clone(), 81)).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["similarity"], 81);

        let json = serde_json::to_value(ScoredItem {
            item,
            similarity: None,
        })
        .unwrap();
        assert!(json["similarity"].is_null());
    }

    #[test]
    fn test_search_state_percent() {
        assert_eq!(SearchState::default().percent(), 0.0);

        let state = SearchState {
            current: 1,
            total: 4,
            busy: true,
        };
        assert_eq!(state.percent(), 25.0);
    }
}
