//! Data types shared by the search pipeline and the HTTP surface

/// Catalog records and image references.
pub mod catalog;
/// Scored items, search outcomes and progress state.
pub mod results;
