use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadingStatus {
    #[serde(rename = "reading")]
    Reading,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "plan-to-read", alias = "planned")]
    Planned,
    #[serde(rename = "dropped")]
    Dropped,
}

impl std::fmt::Display for ReadingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadingStatus::Reading => write!(f, "Reading"),
            ReadingStatus::Completed => write!(f, "Completed"),
            ReadingStatus::Planned => write!(f, "Plan to Read"),
            ReadingStatus::Dropped => write!(f, "Dropped"),
        }
    }
}

/// One reader's progress through one piece of content.
/// The remote service owns it; clients keep a mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub owner_id: String,
    pub content_id: String,
    pub current_chapter_number: u32,
    #[serde(default)]
    pub current_paragraph_index: usize,
    #[serde(default)]
    pub percent_complete: u8,
    pub last_read_at: DateTime<Utc>,
    pub status: ReadingStatus,
    #[serde(default)]
    pub is_favorite: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
}

impl ProgressRecord {
    /// A fresh record positioned at the start of chapter 1.
    pub fn new(owner_id: &str, content_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: None,
            owner_id: owner_id.to_string(),
            content_id: content_id.to_string(),
            current_chapter_number: 1,
            current_paragraph_index: 0,
            percent_complete: 0,
            last_read_at: now,
            status: ReadingStatus::Reading,
            is_favorite: false,
            rating: None,
        }
    }
}

/// Fields to change in a progress record. `None` leaves a field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_chapter_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_paragraph_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent_complete: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_read_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ReadingStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_favorite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<u8>,
}

impl ProgressPatch {
    pub fn apply_to(&self, record: &mut ProgressRecord) {
        if let Some(chapter) = self.current_chapter_number {
            record.current_chapter_number = chapter;
        }
        if let Some(paragraph) = self.current_paragraph_index {
            record.current_paragraph_index = paragraph;
        }
        if let Some(percent) = self.percent_complete {
            record.percent_complete = percent;
        }
        if let Some(at) = self.last_read_at {
            record.last_read_at = at;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(favorite) = self.is_favorite {
            record.is_favorite = favorite;
        }
        if let Some(rating) = self.rating {
            record.rating = Some(rating);
        }
    }
}

/// An upsert against the remote progress store, keyed by owner and content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressWrite {
    pub owner_id: String,
    pub content_id: String,
    pub patch: ProgressPatch,
}

impl ProgressWrite {
    /// The record this write produces when none exists yet.
    pub fn to_new_record(&self, now: DateTime<Utc>) -> ProgressRecord {
        let mut record = ProgressRecord::new(&self.owner_id, &self.content_id, now);
        self.patch.apply_to(&mut record);
        record
    }
}
