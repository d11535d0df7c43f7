//! Data models shared by the caches, the identity session and the
//! progress tracker.
//!
//! - `ChapterMeta`: one row of a content's chapter index (no body text)
//! - `CoverRecord`, `AuthorMedia`: cached media URLs
//! - `IdentityRecord`: the signed-in account, opaque beyond its `id`
//! - `ProgressRecord`, `ProgressPatch`, `ProgressWrite`: reading progress

pub mod chapter;
pub mod identity;
pub mod media;
pub mod progress;

pub use chapter::ChapterMeta;
pub use identity::IdentityRecord;
pub use media::{AuthorMedia, CoverRecord};
pub use progress::{ProgressPatch, ProgressRecord, ProgressWrite, ReadingStatus};
