//! # Enrichment
//!
//! Joins raw engagement events with content reference data.
//!
//! - [`enrich`]: pure function, no I/O
//! - [`ReferenceCache`]: atomically swapped snapshot of `ContentMetadata`,
//!   refreshed on a timer and on cache miss
//! - [`StaticReferenceSource`] / [`JsonFileReferenceSource`]: where the
//!   snapshot comes from

mod cache;
mod engine;
mod sources;

pub use cache::{ReferenceCache, ReferenceSnapshot};
pub use engine::{enrich, round2};
pub use sources::{JsonFileReferenceSource, StaticReferenceSource};
