//! Date parsing for the formats podcast feeds actually publish.
//!
//! RSS mandates RFC 2822 but feeds routinely ship ISO 8601, wrong weekdays,
//! full month names, timezone abbreviations and naive timestamps. Everything
//! is normalized to UTC; naive values are taken to be UTC already.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeDelta, Utc};

const ZONED_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%z",
    "%Y-%m-%dT%H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%z",
    "%Y-%m-%d %H:%M:%S %z",
];

// `%B` also accepts the three-letter abbreviation when parsing; `%b` does not
// accept full names.
const NAIVE_FORMATS: &[&str] = &[
    "%d %B %Y %H:%M:%S",
    "%d %B %Y %H:%M",
    "%d %B %y %H:%M:%S",
    "%B %d %Y %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
];

const DATE_FORMATS: &[&str] = &["%d %B %Y", "%Y-%m-%d", "%B %d %Y", "%m/%d/%Y", "%Y/%m/%d"];

/// Offsets in minutes east of UTC.
const ZONE_ABBREVIATIONS: &[(&str, i32)] = &[
    ("GMT", 0),
    ("UT", 0),
    ("UTC", 0),
    ("Z", 0),
    ("WET", 0),
    ("EST", -5 * 60),
    ("EDT", -4 * 60),
    ("CST", -6 * 60),
    ("CDT", -5 * 60),
    ("MST", -7 * 60),
    ("MDT", -6 * 60),
    ("PST", -8 * 60),
    ("PDT", -7 * 60),
    ("AKST", -9 * 60),
    ("AKDT", -8 * 60),
    ("HST", -10 * 60),
    ("BST", 60),
    ("WEST", 60),
    ("CET", 60),
    ("CEST", 2 * 60),
    ("EET", 2 * 60),
    ("EEST", 3 * 60),
    ("MSK", 3 * 60),
    ("IST", 5 * 60 + 30),
    ("SGT", 8 * 60),
    ("HKT", 8 * 60),
    ("AWST", 8 * 60),
    ("JST", 9 * 60),
    ("KST", 9 * 60),
    ("ACST", 9 * 60 + 30),
    ("AEST", 10 * 60),
    ("AEDT", 11 * 60),
    ("NZST", 12 * 60),
    ("NZDT", 13 * 60),
];

/// Parses a feed date, returning `None` for anything unrecognizable.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(&value) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ZONED_FORMATS {
        if let Ok(dt) = DateTime::<FixedOffset>::parse_from_str(&value, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    // Weekdays are dropped: feeds get them wrong often enough that a
    // mismatch must not reject an otherwise valid date.
    let (body, offset_minutes) = split_zone(strip_weekday(&value));
    let body = body.trim_end_matches(',').trim();

    let naive = NAIVE_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(body, format).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(body, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        });

    match naive {
        Some(naive) => Some((naive - TimeDelta::minutes(i64::from(offset_minutes))).and_utc()),
        None => DateTime::parse_from_rfc2822(&value)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// Formats `dt` for the `If-Modified-Since` header (RFC 1123).
pub fn http_date(dt: DateTime<Utc>) -> String {
    dt.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parses a `Last-Modified` header value.
pub fn parse_http_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn strip_weekday(value: &str) -> &str {
    match value.split_once(',') {
        Some((head, rest)) if head.chars().all(|c| c.is_ascii_alphabetic()) => rest.trim(),
        _ => match value.split_once(' ') {
            Some((head, rest))
                if head.len() >= 3 && head.chars().all(|c| c.is_ascii_alphabetic()) && is_weekday(head) =>
            {
                rest.trim()
            }
            _ => value,
        },
    }
}

fn is_weekday(word: &str) -> bool {
    let word = word.to_ascii_lowercase();
    ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .any(|day| word.starts_with(day))
}

/// Splits a trailing zone (numeric offset or abbreviation) from `value`.
fn split_zone(value: &str) -> (&str, i32) {
    let Some((body, zone)) = value.rsplit_once(' ') else {
        return (value, 0);
    };

    // "+0000 (UTC)" style comments.
    if zone.starts_with('(') {
        return split_zone(body);
    }

    if let Some(minutes) = parse_numeric_offset(zone) {
        return (body, minutes);
    }

    match ZONE_ABBREVIATIONS
        .iter()
        .find(|(abbr, _)| abbr.eq_ignore_ascii_case(zone))
    {
        Some((_, minutes)) => (body, *minutes),
        None => (value, 0),
    }
}

fn parse_numeric_offset(zone: &str) -> Option<i32> {
    let (sign, digits) = match zone.as_bytes().first()? {
        b'+' => (1, &zone[1..]),
        b'-' => (-1, &zone[1..]),
        _ => return None,
    };
    let digits: String = digits.chars().filter(|c| *c != ':').collect();
    if digits.len() != 4 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[..2].parse().ok()?;
    let minutes: i32 = digits[2..].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}
