use serde::{Deserialize, Serialize};

/// Cover image URL of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverRecord {
    pub url: String,
}

/// Avatar and banner URLs of an author, cached together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorMedia {
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub cover_url: String,
}

impl AuthorMedia {
    /// Missing parts are stored as empty strings.
    pub fn new(avatar_url: Option<&str>, cover_url: Option<&str>) -> Self {
        Self {
            avatar_url: avatar_url.unwrap_or_default().to_string(),
            cover_url: cover_url.unwrap_or_default().to_string(),
        }
    }
}
