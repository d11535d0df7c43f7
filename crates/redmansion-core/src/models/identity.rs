use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// The signed-in account.
///
/// Only `id` is relied upon; every other field the remote service sends
/// is kept in `extra` so the persisted snapshot round-trips unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl IdentityRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            email: None,
            full_name: None,
            role: None,
            extra: Map::new(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.full_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_fields_round_trip() {
        let json = r#"{"id":"u1","email":"a@b.c","wallet":"0xabc","settings":{"theme":"dark"}}"#;
        let record: IdentityRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.extra["wallet"], "0xabc");

        let back: Value = serde_json::to_value(&record).unwrap();
        assert_eq!(back["settings"]["theme"], "dark");
        assert_eq!(back["email"], "a@b.c");
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut record = IdentityRecord::new("u1");
        assert_eq!(record.display_name(), "u1");
        record.email = Some("reader@example.com".to_string());
        assert_eq!(record.display_name(), "reader@example.com");
        record.full_name = Some("Daiyu".to_string());
        assert_eq!(record.display_name(), "Daiyu");
    }
}
