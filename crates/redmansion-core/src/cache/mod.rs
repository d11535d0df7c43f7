//! Bounded, session-persisted caches.
//!
//! This module provides the generic [`BoundedCache`] plus the two
//! namespaced caches built on it:
//! - [`MediaUrlCache`]: content cover URLs and author avatar/banner pairs
//! - [`ChapterIndexCache`]: ordered chapter lists per content, with a 24h TTL
//!
//! Every namespace is persisted as one JSON blob in a [`SessionStorage`].

pub mod bounded;
pub mod chapter_index;
pub mod media;
pub mod storage;

pub use bounded::{BoundedCache, CacheConfig, CacheEntry, CacheError, CacheHit, CacheStats};
pub use chapter_index::{ChapterIndexCache, ChapterIndexLookup, IndexLoad, IndexSource};
pub use media::{MediaCacheStats, MediaUrlCache};
pub use storage::{FileStorage, MemoryStorage, SessionStorage, StorageError, StorageResult};
