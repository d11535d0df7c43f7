use thiserror::Error;

use crate::api::ApiError;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Not signed in")]
    SignedOut,

    #[error("No content is open")]
    NoActiveContent,

    #[error("Rating must be between 1 and 5, got {0}")]
    InvalidRating(u8),

    /// The existing record could not be read, so a write could clobber it.
    #[error("Failed to read progress: {0}")]
    Remote(#[from] ApiError),
}
