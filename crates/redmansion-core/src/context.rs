//! Application context.
//!
//! Owns every cache, the identity session and the progress tracker. Views
//! receive the context instead of reaching for globals.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::api::{ApiClient, RemoteService};
use crate::auth::{IdentitySession, IdentityState};
use crate::cache::{
    CacheError, CacheStats, ChapterIndexCache, FileStorage, IndexLoad, MediaCacheStats,
    MediaUrlCache, SessionStorage,
};
use crate::config::Config;
use crate::models::AuthorMedia;
use crate::progress::{ExitReason, ReadingProgressTracker};
use crate::utils::{Clock, SystemClock};

#[derive(Debug, Clone, Serialize)]
pub struct ContextStats {
    pub media: MediaCacheStats,
    pub chapter_index: CacheStats,
    /// Id of the in-memory identity, if any
    pub identity: Option<String>,
}

/// What the caller must do after a logout.
#[derive(Debug)]
pub struct LogoutOutcome {
    /// Identity-bound views must be rebuilt from scratch
    pub reload_views: bool,
    /// Final reading position write issued before the identity was cleared
    pub final_flush: Option<JoinHandle<()>>,
}

pub struct AppContext {
    config: Config,
    remote: Arc<dyn RemoteService>,
    media: Arc<Mutex<MediaUrlCache>>,
    chapter_index: Arc<Mutex<ChapterIndexCache>>,
    identity: IdentitySession,
    tracker: ReadingProgressTracker,
}

impl AppContext {
    pub fn new(
        config: Config,
        storage: Arc<dyn SessionStorage>,
        remote: Arc<dyn RemoteService>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CacheError> {
        let media = MediaUrlCache::new(
            config.cover_cache_config(),
            config.author_cache_config(),
            storage.clone(),
            clock.clone(),
        )?;
        let chapter_index =
            ChapterIndexCache::new(config.chapter_index_config(), storage.clone(), clock.clone())?;
        let identity = IdentitySession::new(storage.clone(), remote.clone());
        let tracker = ReadingProgressTracker::new(
            remote.clone(),
            identity.clone(),
            clock,
            config.tracker_config(),
        );

        Ok(Self {
            config,
            remote,
            media: Arc::new(Mutex::new(media)),
            chapter_index: Arc::new(Mutex::new(chapter_index)),
            identity,
            tracker,
        })
    }

    /// Production wiring: file-backed session storage and the HTTP client.
    pub fn from_config(config: Config) -> Result<Self> {
        let storage_dir = config.storage_dir()?;
        let storage = FileStorage::new(storage_dir.clone())
            .with_context(|| format!("Failed to open session storage at {}", storage_dir.display()))?;

        let mut client = ApiClient::new(&config.api_base_url)?;
        if let Some(token) = config.api_token.clone() {
            client.set_token(token);
        }
        debug!(base_url = client.base_url(), "Using remote service");

        Ok(Self::new(
            config,
            Arc::new(storage),
            Arc::new(client),
            Arc::new(SystemClock),
        )?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn identity(&self) -> &IdentitySession {
        &self.identity
    }

    pub fn tracker(&self) -> &ReadingProgressTracker {
        &self.tracker
    }

    pub fn media(&self) -> &Arc<Mutex<MediaUrlCache>> {
        &self.media
    }

    pub fn chapter_index(&self) -> &Arc<Mutex<ChapterIndexCache>> {
        &self.chapter_index
    }

    /// Called on mount and on every navigation.
    pub fn on_navigate(&self) -> Option<JoinHandle<()>> {
        self.identity.on_navigate()
    }

    pub async fn load_chapter_index(&self, content_id: &str) -> IndexLoad {
        ChapterIndexCache::load(&self.chapter_index, &self.remote, content_id).await
    }

    pub async fn cover_url(&self, content_id: &str, remote_url: &str) -> String {
        self.media
            .lock()
            .await
            .get_or_fetch_cover(content_id, remote_url)
    }

    pub async fn author_media(
        &self,
        author_key: &str,
        avatar_url: Option<&str>,
        cover_url: Option<&str>,
    ) -> AuthorMedia {
        self.media
            .lock()
            .await
            .get_or_fetch_author_media(author_key, avatar_url, cover_url)
    }

    /// Flush the reading position while still signed in, then sign out.
    pub async fn logout(&self) -> LogoutOutcome {
        let final_flush = self.tracker.on_exit(ExitReason::NavigateAway);
        self.identity.logout().await;
        info!("Logged out, identity-bound views must reload");
        LogoutOutcome {
            reload_views: true,
            final_flush,
        }
    }

    pub async fn clear_caches(&self) {
        self.media.lock().await.clear();
        self.chapter_index.lock().await.clear();
        info!("Cleared media and chapter index caches");
    }

    pub async fn stats(&self) -> ContextStats {
        let media = self.media.lock().await.stats();
        let chapter_index = self.chapter_index.lock().await.stats();
        let identity = match self.identity.state() {
            IdentityState::Expired | IdentityState::SignedOut => None,
            _ => self.identity.current().map(|record| record.id),
        };
        ContextStats {
            media,
            chapter_index,
            identity,
        }
    }
}
