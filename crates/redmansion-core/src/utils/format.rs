use chrono::{DateTime, Utc};

/// Format the age of a timestamp for display ("just now", "5m ago", "2h ago", "3d ago").
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let minutes = (now - since).num_minutes();
    if minutes < 1 {
        // Also covers clock skew (negative ages)
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        let remaining_mins = minutes % 60;
        if remaining_mins >= 30 {
            // Round up: 1h 30m+ becomes 2h
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        let remaining_hours = (minutes % 1440) / 60;
        if remaining_hours >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Normalize a lookup key: trimmed and lower-cased.
/// Author keys arrive in mixed case from different screens.
pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_age() {
        let now = Utc::now();
        assert_eq!(format_age(now, now), "just now");
        assert_eq!(format_age(now + Duration::minutes(3), now), "just now");
        assert_eq!(format_age(now - Duration::minutes(5), now), "5m ago");
        assert_eq!(format_age(now - Duration::minutes(90), now), "2h ago");
        assert_eq!(format_age(now - Duration::minutes(61), now), "1h ago");
        assert_eq!(format_age(now - Duration::days(3), now), "3d ago");
    }

    #[test]
    fn test_normalize_key() {
        assert_eq!(normalize_key("  0xAbCd "), "0xabcd");
        assert_eq!(normalize_key("plain"), "plain");
    }
}
