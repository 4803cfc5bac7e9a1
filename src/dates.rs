//! Lenient date handling for feed timestamps.
//!
//! Feeds and scraped pages carry dates in whatever shape the publisher
//! chose. Everything here returns `None` rather than failing, and callers
//! decide what an unparseable date means.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%B %d, %Y", "%b %d, %Y", "%d %B %Y", "%d %b %Y"];

/// Parse a date string in any of the common feed/page formats.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return date.and_hms_opt(0, 0, 0).map(|naive| Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Interpret a millisecond epoch timestamp.
pub fn from_epoch_millis(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let digits = raw.strip_prefix('-').unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let millis: i64 = raw.parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

/// Normalize a scraped `published` value: epoch millis or a parseable date
/// become RFC 3339, anything else is kept verbatim.
pub fn normalize_published(raw: &str) -> String {
    from_epoch_millis(raw)
        .or_else(|| parse_date(raw))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| raw.trim().to_string())
}

/// Human readable distance between `then` and `now`, e.g. "3 hours ago".
pub fn format_relative(then: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - then).num_seconds();
    let future = seconds < 0;
    let seconds = seconds.unsigned_abs();
    let minutes = (seconds + 30) / 60;

    let distance = match minutes {
        0 => "less than a minute".to_string(),
        1 => "1 minute".to_string(),
        2..=44 => format!("{} minutes", minutes),
        45..=89 => "about 1 hour".to_string(),
        90..=1439 => format!("about {} hours", (minutes + 30) / 60),
        1440..=2519 => "1 day".to_string(),
        2520..=43199 => format!("{} days", (minutes + 720) / 1440),
        43200..=86399 => "about 1 month".to_string(),
        86400..=525599 => format!("{} months", (minutes + 21600) / 43200),
        _ => {
            let years = minutes / 525_600;
            if years <= 1 {
                "about 1 year".to_string()
            } else {
                format!("over {} years", years)
            }
        }
    };

    if future {
        format!("in {}", distance)
    } else {
        format!("{} ago", distance)
    }
}
