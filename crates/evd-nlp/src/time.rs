//! Publish-time parsing for the formats A-share providers actually emit.
//!
//! Accepted: `YYYYMMDD`, `YYYY-MM-DD[ HH:MM[:SS]]`, `YYYY/M/D[ HH:MM[:SS]]`,
//! and RFC 3339. Naive values are interpreted in the given IANA timezone
//! (falling back to UTC when the name is unknown) and converted to UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const NAIVE_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];

pub fn parse_announcement_time(raw: &str, timezone_name: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    // RFC 3339 carries its own offset.
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.with_timezone(&Utc));
    }

    let tz: Tz = timezone_name.parse().unwrap_or(chrono_tz::UTC);

    // Tushare-style yyyymmdd.
    if trimmed.len() == 8 && trimmed.chars().all(|c| c.is_ascii_digit()) {
        let date = NaiveDate::parse_from_str(trimmed, "%Y%m%d").ok()?;
        return localize(tz, date.and_hms_opt(0, 0, 0)?);
    }

    for fmt in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return localize(tz, dt);
        }
    }
    for fmt in NAIVE_DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, fmt) {
            return localize(tz, date.and_hms_opt(0, 0, 0)?);
        }
    }

    None
}

fn localize(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn parses_compact_date_in_source_timezone() {
        // 2024-05-06 00:00 Asia/Shanghai == 2024-05-05 16:00 UTC.
        let parsed = parse_announcement_time("20240506", "Asia/Shanghai").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-05T16:00:00+00:00");
    }

    #[test]
    fn parses_dash_and_slash_datetimes() {
        let a = parse_announcement_time("2024-05-06 09:30:00", "Asia/Shanghai").unwrap();
        let b = parse_announcement_time("2024/05/06 09:30", "Asia/Shanghai").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hour(), 1); // 09:30 CST == 01:30 UTC
    }

    #[test]
    fn rfc3339_keeps_its_own_offset() {
        let parsed = parse_announcement_time("2024-05-06T09:30:00+08:00", "UTC").unwrap();
        assert_eq!(parsed.hour(), 1);
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let parsed = parse_announcement_time("2024-05-06", "Not/AZone").unwrap();
        assert_eq!(parsed.to_rfc3339(), "2024-05-06T00:00:00+00:00");
    }

    #[test]
    fn garbage_is_none() {
        assert!(parse_announcement_time("soon", "UTC").is_none());
        assert!(parse_announcement_time("", "UTC").is_none());
    }
}
