use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::bounded::{BoundedCache, CacheConfig, CacheError, CacheStats};
use super::storage::SessionStorage;
use crate::api::RemoteService;
use crate::models::ChapterMeta;
use crate::utils::Clock;

pub const CHAPTER_INDEX_NAMESPACE: &str = "redmansion_chapter_list_cache";

pub const DEFAULT_MAX_CHAPTER_LISTS: usize = 40;

/// Chapter lists change rarely; a day-old list is still worth showing.
pub const DEFAULT_CHAPTER_INDEX_TTL_HOURS: i64 = 24;

/// Result of [`ChapterIndexCache::get_index`]. A miss is `chapters: None, expired: true`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterIndexLookup {
    pub chapters: Option<Vec<ChapterMeta>>,
    pub expired: bool,
}

/// Where a loaded chapter index came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexSource {
    /// Cached and within TTL
    Fresh,
    /// Cached but past TTL; a background refresh was started or is
    /// already running
    Stale,
    /// Not cached; fetched from the remote service
    Fetched,
    /// Not cached and the fetch failed
    Unavailable,
}

pub struct IndexLoad {
    pub chapters: Vec<ChapterMeta>,
    pub source: IndexSource,
    /// Background refresh for stale hits. `None` when another load already
    /// has one running for the same content.
    pub refresh: Option<JoinHandle<()>>,
}

pub struct ChapterIndexCache {
    lists: BoundedCache<String, Vec<ChapterMeta>>,
    /// Content ids with a background refresh in flight
    refreshing: HashSet<String>,
}

impl ChapterIndexCache {
    pub fn new(
        config: CacheConfig,
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        Ok(Self {
            lists: BoundedCache::new(config, storage, clock)?,
            refreshing: HashSet::new(),
        })
    }

    pub fn with_defaults(
        storage: Arc<dyn SessionStorage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        Self::new(
            CacheConfig::new(CHAPTER_INDEX_NAMESPACE, DEFAULT_MAX_CHAPTER_LISTS)
                .with_ttl(Duration::hours(DEFAULT_CHAPTER_INDEX_TTL_HOURS)),
            storage,
            clock,
        )
    }

    pub fn get_index(&mut self, content_id: &str) -> ChapterIndexLookup {
        match self.lists.get(&content_id.to_string()) {
            Some(hit) => ChapterIndexLookup {
                chapters: Some(hit.value),
                expired: hit.is_expired,
            },
            None => ChapterIndexLookup {
                chapters: None,
                expired: true,
            },
        }
    }

    pub fn set_index(&mut self, content_id: &str, chapters: Vec<ChapterMeta>) {
        if content_id.is_empty() {
            return;
        }
        self.lists.set(content_id.to_string(), chapters);
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.lists.stats()
    }

    /// Load a chapter index, serving stale data while revalidating.
    ///
    /// A fresh hit returns immediately. A stale hit returns the cached list
    /// and refreshes it in the background, at most one refresh per content
    /// id at a time. A miss fetches in the foreground. Failed or empty
    /// fetches are not cached.
    pub async fn load(
        cache: &Arc<Mutex<Self>>,
        remote: &Arc<dyn RemoteService>,
        content_id: &str,
    ) -> IndexLoad {
        let (lookup, start_refresh) = {
            let mut guard = cache.lock().await;
            let lookup = guard.get_index(content_id);
            let start_refresh = lookup.expired
                && lookup.chapters.is_some()
                && guard.refreshing.insert(content_id.to_string());
            (lookup, start_refresh)
        };

        match lookup {
            ChapterIndexLookup {
                chapters: Some(chapters),
                expired: false,
            } => {
                debug!(content_id = content_id, "Using cached chapter list");
                IndexLoad {
                    chapters,
                    source: IndexSource::Fresh,
                    refresh: None,
                }
            }
            ChapterIndexLookup {
                chapters: Some(chapters),
                expired: true,
            } => {
                let refresh = if start_refresh {
                    debug!(content_id = content_id, "Cached chapter list expired, refreshing in background");
                    Some(tokio::spawn(Self::refresh(
                        cache.clone(),
                        remote.clone(),
                        content_id.to_string(),
                    )))
                } else {
                    debug!(content_id = content_id, "Cached chapter list expired, refresh already running");
                    None
                };
                IndexLoad {
                    chapters,
                    source: IndexSource::Stale,
                    refresh,
                }
            }
            ChapterIndexLookup { chapters: None, .. } => {
                match remote.fetch_chapter_list(content_id).await {
                    Ok(chapters) => {
                        if !chapters.is_empty() {
                            cache.lock().await.set_index(content_id, chapters.clone());
                        }
                        IndexLoad {
                            chapters,
                            source: IndexSource::Fetched,
                            refresh: None,
                        }
                    }
                    Err(e) => {
                        warn!(content_id = content_id, error = %e, "Failed to fetch chapter list");
                        IndexLoad {
                            chapters: Vec::new(),
                            source: IndexSource::Unavailable,
                            refresh: None,
                        }
                    }
                }
            }
        }
    }

    async fn refresh(cache: Arc<Mutex<Self>>, remote: Arc<dyn RemoteService>, content_id: String) {
        let result = remote.fetch_chapter_list(&content_id).await;

        let mut guard = cache.lock().await;
        guard.refreshing.remove(&content_id);
        match result {
            Ok(chapters) if !chapters.is_empty() => {
                debug!(content_id = %content_id, count = chapters.len(), "Refreshed chapter list");
                guard.set_index(&content_id, chapters);
            }
            Ok(_) => {
                debug!(content_id = %content_id, "Refresh returned no chapters, keeping cached list");
            }
            Err(e) => {
                warn!(content_id = %content_id, error = %e, "Background chapter list refresh failed");
            }
        }
    }
}
