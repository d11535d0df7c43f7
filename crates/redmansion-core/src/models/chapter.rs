use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Chapter metadata as listed in a content's chapter index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterMeta {
    pub id: String,
    pub chapter_number: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub word_count: Option<u32>,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
}

impl ChapterMeta {
    pub fn new(id: impl Into<String>, chapter_number: u32, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            chapter_number,
            title: title.into(),
            word_count: None,
            published_at: None,
        }
    }

    pub fn display_title(&self) -> String {
        if self.title.is_empty() {
            format!("Chapter {}", self.chapter_number)
        } else {
            format!("Chapter {}: {}", self.chapter_number, self.title)
        }
    }
}

/// Find a chapter by number in an ordered index.
pub fn find_by_number(chapters: &[ChapterMeta], chapter_number: u32) -> Option<&ChapterMeta> {
    chapters.iter().find(|c| c.chapter_number == chapter_number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_title() {
        assert_eq!(ChapterMeta::new("c1", 1, "").display_title(), "Chapter 1");
        assert_eq!(
            ChapterMeta::new("c2", 2, "The Garden").display_title(),
            "Chapter 2: The Garden"
        );
    }

    #[test]
    fn test_deserialize_minimal_row() {
        let meta: ChapterMeta =
            serde_json::from_str(r#"{"id":"c9","chapter_number":9}"#).unwrap();
        assert_eq!(meta.chapter_number, 9);
        assert!(meta.title.is_empty());
        assert!(meta.word_count.is_none());
    }

    #[test]
    fn test_find_by_number() {
        let chapters = vec![ChapterMeta::new("a", 1, ""), ChapterMeta::new("b", 2, "")];
        assert_eq!(find_by_number(&chapters, 2).map(|c| c.id.as_str()), Some("b"));
        assert!(find_by_number(&chapters, 3).is_none());
    }
}
