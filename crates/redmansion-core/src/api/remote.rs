use async_trait::async_trait;

use super::ApiResult;
use crate::models::{ChapterMeta, IdentityRecord, ProgressRecord, ProgressWrite};

/// Operations the client needs from the remote data service.
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Ordered chapter index of a content. An unknown content yields an empty list.
    async fn fetch_chapter_list(&self, content_id: &str) -> ApiResult<Vec<ChapterMeta>>;

    /// The identity behind the current session. Fails when signed out.
    async fn fetch_identity(&self) -> ApiResult<IdentityRecord>;

    async fn read_progress(
        &self,
        owner_id: &str,
        content_id: &str,
    ) -> ApiResult<Option<ProgressRecord>>;

    /// Upsert a progress record and return the stored version.
    async fn write_progress(&self, write: &ProgressWrite) -> ApiResult<ProgressRecord>;

    async fn logout(&self) -> ApiResult<()>;
}
