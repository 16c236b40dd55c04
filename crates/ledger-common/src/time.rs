//! Epoch-millisecond helpers.
//!
//! The exchange reports every timestamp as milliseconds since the Unix epoch.
//! Ledgers keep that raw value for watermarks and add a human-readable UTC
//! column derived from it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};

/// One UTC day in milliseconds.
pub const DAY_MS: i64 = 86_400_000;

/// Format used for the `UTCTime` ledger column.
pub const UTC_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Converts epoch milliseconds to a UTC datetime.
///
/// Out-of-range values collapse to the Unix epoch.
pub fn utc_from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

/// UTC calendar date of an epoch-millisecond timestamp.
pub fn utc_date_from_ms(ms: i64) -> NaiveDate {
    utc_from_ms(ms).date_naive()
}

/// Start of the UTC day containing `ms`.
pub fn day_start_ms(ms: i64) -> i64 {
    ms - ms.rem_euclid(DAY_MS)
}

/// Parses a `YYYY-MM-DD HH:MM:SS` UTC string into epoch milliseconds.
pub fn parse_utc_ms(s: &str) -> Option<i64> {
    NaiveDateTime::parse_from_str(s.trim(), UTC_FORMAT)
        .ok()
        .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis())
}

/// Serde adapter writing datetimes as `YYYY-MM-DD HH:MM:SS`.
pub mod utc_datetime {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::UTC_FORMAT;

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&dt.format(UTC_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(raw.trim(), UTC_FORMAT)
            .map(|dt| dt.and_utc())
            .map_err(serde::de::Error::custom)
    }
}
