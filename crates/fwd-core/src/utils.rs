use chrono::{DateTime, Utc};

// ============== Timestamp Helpers ==============

/// RFC3339 timestamp in UTC (for state files).
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Compact timestamp for chat listings, e.g. `2024-05-01 13:07:45`.
pub fn short_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

// ============== Text Helpers ==============

/// Cut `s` to at most `max_chars` characters, marking the cut with `...`.
pub fn truncate_text(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out = s.chars().take(max_chars).collect::<String>();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn truncate_text_adds_ellipsis() {
        let s = "a".repeat(20);
        assert_eq!(truncate_text(&s, 20), s);
        let t = truncate_text(&s, 5);
        assert_eq!(t, "aaaaa...");
    }

    #[test]
    fn truncate_text_counts_chars_not_bytes() {
        assert_eq!(truncate_text("привет", 3), "при...");
    }

    #[test]
    fn short_timestamp_format() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 13, 7, 45).unwrap();
        assert_eq!(short_timestamp(&ts), "2024-05-01 13:07:45");
    }
}
