//! Core library for the redmansion reading client.
//!
//! This crate contains the client-side cache and synchronization engine,
//! independent of any UI:
//! - [`cache`]: bounded, session-persisted caches (media URLs, chapter indexes)
//! - [`auth`]: stale-while-revalidate identity session
//! - [`progress`]: scroll sampling and guarded progress writes
//! - [`api`]: the remote service trait and its HTTP client
//! - [`context`]: the application context that owns all of the above

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod models;
pub mod progress;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types at crate root
pub use api::{ApiClient, ApiError, RemoteService};
pub use auth::{IdentitySession, IdentityState};
pub use cache::{
    BoundedCache, CacheConfig, CacheStats, ChapterIndexCache, FileStorage, MediaUrlCache,
    MemoryStorage, SessionStorage,
};
pub use config::Config;
pub use context::AppContext;
pub use progress::{ExitReason, ProgressError, ReadingProgressTracker};
