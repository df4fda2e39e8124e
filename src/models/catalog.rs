use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::path::Path;

use crate::core::filter::PriceRange;
use crate::core::hash::reference_key;
use crate::error::{AppError, Result, ResultExt};

/// Longest prefix of a reference shown in logs and error messages.
const DISPLAY_LIMIT: usize = 64;

/// Opaque identifier of an image: a URL, a web path, a file path or a `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageReference(String);

impl ImageReference {
    /// Wraps a raw reference string.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The reference exactly as supplied.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the image is carried inline as a `data:` URI.
    pub fn is_data_uri(&self) -> bool {
        self.0.starts_with("data:")
    }

    /// Key under which this reference's embedding is cached.
    pub fn cache_key(&self) -> String {
        reference_key(&self.0)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.len() <= DISPLAY_LIMIT {
            return f.write_str(&self.0);
        }
        let mut end = DISPLAY_LIMIT;
        while !self.0.is_char_boundary(end) {
            end -= 1;
        }
        write!(f, "{}... ({} bytes)", &self.0[..end], self.0.len())
    }
}

impl From<&str> for ImageReference {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ImageReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A product in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogItem {
    /// Unique product identifier.
    pub id: u64,
    /// Display name.
    pub name: String,
    /// Category label used by the category filter.
    pub category: String,
    /// Non-negative price.
    pub price: f64,
    /// Product photo.
    pub image: ImageReference,
}

/// The fixed set of products a search ranks.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Catalog {
    items: Vec<CatalogItem>,
}

impl Catalog {
    /// Builds a catalog, rejecting invalid prices and duplicate ids.
    pub fn from_items(items: Vec<CatalogItem>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(items.len());
        for item in &items {
            if !item.price.is_finite() || item.price < 0.0 {
                return Err(AppError::Validation(format!(
                    "product {} has invalid price {}",
                    item.id, item.price
                )));
            }
            if !seen.insert(item.id) {
                return Err(AppError::Validation(format!("duplicate product id {}", item.id)));
            }
        }
        Ok(Self { items })
    }

    /// Parses the JSON product list.
    pub fn from_json(json: &str) -> Result<Self> {
        let items: Vec<CatalogItem> = serde_json::from_str(json)?;
        Self::from_items(items)
    }

    /// Loads the JSON product list from disk.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading catalog from {}", path.display());

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading catalog {}", path.display()))?;
        let catalog = Self::from_json(&json)?;

        log::info!("Loaded {} products from {}", catalog.len(), path.display());
        Ok(catalog)
    }

    /// All products in catalog order.
    pub fn items(&self) -> &[CatalogItem] {
        &self.items
    }

    /// Number of products.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the catalog has no products.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Unique category labels, sorted.
    pub fn categories(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.category.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Whole-number price span of the catalog, used as the default price filter.
    pub fn price_bounds(&self) -> PriceRange {
        let mut prices = self.items.iter().map(|item| item.price);
        let Some(first) = prices.next() else {
            return PriceRange::default();
        };
        let (min, max) = prices.fold((first, first), |(lo, hi), p| (lo.min(p), hi.max(p)));
        PriceRange {
            min: min.floor(),
            max: max.ceil(),
        }
    }
}
