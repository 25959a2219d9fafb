use chrono::{DateTime, Utc};

/// Format an age in minutes as "just now", "5m ago", "2h ago" or "3d ago".
///
/// Hours and days round half up: 1h 30m becomes "2h ago", 1d 12h becomes
/// "2d ago".
pub fn format_age(minutes: i64) -> String {
    if minutes < 1 {
        // Negative ages come from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m ago", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        if minutes % 60 >= 30 {
            format!("{}h ago", hours + 1)
        } else {
            format!("{}h ago", hours)
        }
    } else {
        let days = minutes / 1440;
        if (minutes % 1440) / 60 >= 12 {
            format!("{}d ago", days + 1)
        } else {
            format!("{}d ago", days)
        }
    }
}

/// Relative label for the last successful sync.
pub fn format_last_sync(timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(at) => format_age((Utc::now() - at).num_minutes()),
        None => "never".to_string(),
    }
}

/// "1 change", "3 changes"
pub fn pluralize(count: usize, noun: &str) -> String {
    if count == 1 {
        format!("{} {}", count, noun)
    } else {
        format!("{} {}s", count, noun)
    }
}

/// Upper-case the first character.
pub fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_age() {
        assert_eq!(format_age(-3), "just now");
        assert_eq!(format_age(0), "just now");
        assert_eq!(format_age(5), "5m ago");
        assert_eq!(format_age(89), "1h ago");
        assert_eq!(format_age(90), "2h ago");
        assert_eq!(format_age(1440 + 11 * 60), "1d ago");
        assert_eq!(format_age(1440 + 12 * 60), "2d ago");
    }

    #[test]
    fn test_format_last_sync() {
        assert_eq!(format_last_sync(None), "never");
        assert_eq!(format_last_sync(Some(Utc::now())), "just now");
        assert_eq!(format_last_sync(Some(Utc::now() - Duration::minutes(5))), "5m ago");
        assert_eq!(format_last_sync(Some(Utc::now() - Duration::hours(2))), "2h ago");
        assert_eq!(format_last_sync(Some(Utc::now() - Duration::days(3))), "3d ago");
    }

    #[test]
    fn test_pluralize_and_capitalize() {
        assert_eq!(pluralize(1, "change"), "1 change");
        assert_eq!(pluralize(0, "change"), "0 changes");
        assert_eq!(pluralize(3, "change"), "3 changes");
        assert_eq!(capitalize("connection lost"), "Connection lost");
        assert_eq!(capitalize(""), "");
    }

    #[test]
    fn test_truncate_string() {
        assert_eq!(truncate_string("Hello", 10), "Hello");
        assert_eq!(truncate_string("Hello World", 8), "Hello...");
        assert_eq!(truncate_string("Hi", 2), "Hi");
        assert_eq!(truncate_string("Oración por la familia", 10), "Oración...");
    }
}
