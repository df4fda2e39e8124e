//! Narrowing ranked results by similarity, category and price.

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::results::ScoredItem;

/// Minimum similarity applied when the caller doesn't choose one.
pub const DEFAULT_MIN_SIMILARITY: u8 = 40;
/// Category value that disables category filtering.
pub const ALL_CATEGORIES: &str = "all";

/// Inclusive price interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceRange {
    /// Lower bound.
    pub min: f64,
    /// Upper bound.
    pub max: f64,
}

impl Default for PriceRange {
    fn default() -> Self {
        Self { min: 0.0, max: 1000.0 }
    }
}

impl PriceRange {
    /// Validates and builds a range; both bounds must be non-negative with `min <= max`.
    pub fn new(min: f64, max: f64) -> Result<Self> {
        if !min.is_finite() || !max.is_finite() || min < 0.0 || max < 0.0 {
            return Err(AppError::Validation(format!(
                "price bounds must be non-negative numbers, got [{}, {}]",
                min, max
            )));
        }
        if min > max {
            return Err(AppError::Validation(format!(
                "price minimum {} exceeds maximum {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    /// Whether `price` lies within the range, bounds included.
    pub fn contains(&self, price: f64) -> bool {
        self.min <= price && price <= self.max
    }
}

/// Category selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CategoryFilter {
    /// Every category passes.
    #[default]
    All,
    /// Only this exact category passes.
    Only(String),
}

impl CategoryFilter {
    /// Whether `category` passes.
    pub fn matches(&self, category: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(wanted) => wanted == category,
        }
    }
}

impl From<&str> for CategoryFilter {
    fn from(value: &str) -> Self {
        if value == ALL_CATEGORIES {
            Self::All
        } else {
            Self::Only(value.to_string())
        }
    }
}

/// The user's current filter controls.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultFilter {
    /// Minimum similarity percentage.
    pub min_similarity: u8,
    /// Category selection.
    pub category: CategoryFilter,
    /// Price interval.
    pub price_range: PriceRange,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            min_similarity: DEFAULT_MIN_SIMILARITY,
            category: CategoryFilter::All,
            price_range: PriceRange::default(),
        }
    }
}

impl ResultFilter {
    /// Validates and builds a filter.
    pub fn new(min_similarity: u8, category: CategoryFilter, price_range: PriceRange) -> Result<Self> {
        if min_similarity > 100 {
            return Err(AppError::Validation(format!(
                "minimum similarity must be within 0..=100, got {}",
                min_similarity
            )));
        }
        Ok(Self {
            min_similarity,
            category,
            price_range,
        })
    }

    /// Whether a single item passes every control. Unscored items count as 0.
    pub fn matches(&self, item: &ScoredItem) -> bool {
        item.similarity.unwrap_or(0) >= self.min_similarity
            && self.category.matches(&item.item.category)
            && self.price_range.contains(item.item.price)
    }

    /// The passing items, in their original relative order.
    pub fn apply(&self, items: &[ScoredItem]) -> Vec<ScoredItem> {
        items.iter().filter(|item| self.matches(item)).cloned().collect()
    }
}

/// Free-function form of [`ResultFilter::apply`] for callers holding raw controls.
pub fn filter(
    items: &[ScoredItem],
    min_similarity: u8,
    category: &str,
    price_range: PriceRange,
) -> Vec<ScoredItem> {
    let filter = ResultFilter {
        min_similarity,
        category: CategoryFilter::from(category),
        price_range,
    };
    filter.apply(items)
}
