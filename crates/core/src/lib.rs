//! Core types for static test collection - records, filters, config, cache.
//! No parsing, no async dependencies.

pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod model;

pub use cache::{CacheEntry, CacheStats, CacheStore};
pub use config::{Config, normalize_path};
pub use error::{ParseError, Result};
pub use filter::{FilterError, FilterExpression, Filters, evaluate};
pub use model::{ItemKind, TestRecord};

/// Apply `expression` to `records`, keeping order.
#[must_use]
pub fn select(records: &[TestRecord], expression: Option<&FilterExpression>) -> Vec<TestRecord> {
    records
        .iter()
        .filter(|r| evaluate(r, expression))
        .cloned()
        .collect()
}
