use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::bounded::{BoundedCache, CacheConfig, CacheError, CacheStats};
use super::storage::SessionStorage;
use crate::models::{AuthorMedia, CoverRecord};
use crate::utils::{normalize_key, Clock};

pub const COVER_NAMESPACE: &str = "redmansion_cover_cache";
pub const AUTHOR_NAMESPACE: &str = "redmansion_author_media_cache";

/// Covers shown across list views.
pub const DEFAULT_MAX_COVERS: usize = 40;

pub const DEFAULT_MAX_AUTHORS: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct MediaCacheStats {
    pub covers: CacheStats,
    pub authors: CacheStats,
}

/// Deduplicates media URL lookups across list renders.
/// URLs are stored and returned verbatim.
pub struct MediaUrlCache {
    covers: BoundedCache<String, CoverRecord>,
    authors: BoundedCache<String, AuthorMedia>,
}

impl MediaUrlCache {
    pub fn new(
        covers: CacheConfig,
        authors: CacheConfig,
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            covers: BoundedCache::new(covers, storage.clone(), clock.clone())?,
            authors: BoundedCache::new(authors, storage, clock)?,
        })
    }

    pub fn with_defaults(
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        Self::new(
            CacheConfig::new(COVER_NAMESPACE, DEFAULT_MAX_COVERS),
            CacheConfig::new(AUTHOR_NAMESPACE, DEFAULT_MAX_AUTHORS),
            storage,
            clock,
        )
    }

    pub fn cover(&mut self, content_id: &str) -> Option<String> {
        self.covers
            .get(&content_id.to_string())
            .map(|hit| hit.value.url)
    }

    pub fn set_cover(&mut self, content_id: &str, url: &str) {
        if content_id.is_empty() || url.is_empty() {
            return;
        }
        self.covers.set(
            content_id.to_string(),
            CoverRecord {
                url: url.to_string(),
            },
        );
    }

    /// The cached cover URL, or `remote_url` after caching it.
    pub fn get_or_fetch_cover(&mut self, content_id: &str, remote_url: &str) -> String {
        if let Some(url) = self.cover(content_id) {
            debug!(content_id = content_id, "Cover URL cache hit");
            return url;
        }
        self.set_cover(content_id, remote_url);
        remote_url.to_string()
    }

    pub fn author_media(&mut self, author_key: &str) -> Option<AuthorMedia> {
        self.authors
            .get(&normalize_key(author_key))
            .map(|hit| hit.value)
    }

    pub fn set_author_media(
        &mut self,
        author_key: &str,
        avatar_url: Option<&str>,
        cover_url: Option<&str>,
    ) {
        let key = normalize_key(author_key);
        if key.is_empty() {
            return;
        }
        self.authors.set(key, AuthorMedia::new(avatar_url, cover_url));
    }

    pub fn get_or_fetch_author_media(
        &mut self,
        author_key: &str,
        avatar_url: Option<&str>,
        cover_url: Option<&str>,
    ) -> AuthorMedia {
        if let Some(media) = self.author_media(author_key) {
            return media;
        }
        self.set_author_media(author_key, avatar_url, cover_url);
        AuthorMedia::new(avatar_url, cover_url)
    }

    pub fn clear(&mut self) {
        self.covers.clear();
        self.authors.clear();
    }

    pub fn stats(&self) -> MediaCacheStats {
        MediaCacheStats {
            covers: self.covers.stats(),
            authors: self.authors.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::storage::MemoryStorage;
    use crate::utils::ManualClock;

    fn media_cache(storage: Arc<dyn SessionStorage>) -> MediaUrlCache {
        MediaUrlCache::with_defaults(storage, Arc::new(ManualClock::default())).unwrap()
    }

    #[test]
    fn test_get_or_fetch_cover_returns_cached_url() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));

        let first = cache.get_or_fetch_cover("n1", "https://cdn/a.jpg");
        assert_eq!(first, "https://cdn/a.jpg");

        // A later render with a different remote URL still gets the cached one
        let second = cache.get_or_fetch_cover("n1", "https://cdn/b.jpg");
        assert_eq!(second, "https://cdn/a.jpg");
    }

    #[test]
    fn test_empty_ids_and_urls_not_cached() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));
        cache.set_cover("", "https://cdn/a.jpg");
        cache.set_cover("n1", "");
        assert_eq!(cache.stats().covers.size, 0);

        // Still returned unchanged
        assert_eq!(cache.get_or_fetch_cover("n2", ""), "");
        assert!(cache.cover("n2").is_none());
    }

    #[test]
    fn test_cover_capacity_is_forty() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));
        for i in 0..100 {
            cache.set_cover(&format!("n{}", i), &format!("https://cdn/{}.jpg", i));
            assert!(cache.stats().covers.size <= DEFAULT_MAX_COVERS);
        }
        assert_eq!(cache.stats().covers.max_entries, 40);
        assert!(cache.stats().covers.ttl_hours.is_none());
    }

    #[test]
    fn test_author_keys_are_case_normalized() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));
        cache.set_author_media("0xABCdef", Some("https://cdn/av.png"), None);

        let media = cache.author_media("0xabcDEF").unwrap();
        assert_eq!(media.avatar_url, "https://cdn/av.png");
        assert_eq!(media.cover_url, "");
    }

    #[test]
    fn test_author_pair_stored_atomically() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));
        assert!(cache.author_media("a1").is_none());

        let media = cache.get_or_fetch_author_media("a1", Some("av"), Some("cv"));
        assert_eq!(media, AuthorMedia::new(Some("av"), Some("cv")));

        let cached = cache.get_or_fetch_author_media("A1", Some("other"), None);
        assert_eq!(cached.avatar_url, "av");
        assert_eq!(cached.cover_url, "cv");
    }

    #[test]
    fn test_author_capacity_is_twenty() {
        let mut cache = media_cache(Arc::new(MemoryStorage::new()));
        for i in 0..50 {
            cache.set_author_media(&format!("author{}", i), Some("a"), Some("c"));
            assert!(cache.stats().authors.size <= DEFAULT_MAX_AUTHORS);
        }
    }

    #[test]
    fn test_namespaces_persist_independently() {
        let storage = Arc::new(MemoryStorage::new());
        let mut cache = media_cache(storage.clone());
        cache.set_cover("n1", "https://cdn/a.jpg");
        cache.set_author_media("a1", Some("av"), Some("cv"));

        assert!(storage.get_item(COVER_NAMESPACE).unwrap().is_some());
        assert!(storage.get_item(AUTHOR_NAMESPACE).unwrap().is_some());

        let mut reloaded = media_cache(storage.clone());
        assert_eq!(reloaded.cover("n1").as_deref(), Some("https://cdn/a.jpg"));

        reloaded.clear();
        assert!(storage.get_item(COVER_NAMESPACE).unwrap().is_none());
        assert!(storage.get_item(AUTHOR_NAMESPACE).unwrap().is_none());
    }
}
