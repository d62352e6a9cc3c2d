//! Content-addressed asset cache.
//!
//! Renderer binaries and scene archives are stored once under their
//! SHA-256 digest, bounded by a byte budget and evicted least recently
//! used. Concurrent requests for the same key share a single download.
//! The cache directory is the worker's only persisted state.

pub mod fetcher;
pub mod store;

pub use fetcher::{AssetFetcher, FetchError};
pub use store::{AssetCache, CacheConfig, CacheError};
