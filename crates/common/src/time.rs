//! Wall-clock helpers and bucket-key derivation.
//!
//! Log timestamps and the hour keys of the buckets that hold them are derived
//! from the same millisecond instant, so a log can never land in a bucket
//! whose key disagrees with its own timestamp.

use chrono::{DateTime, Utc};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn utc(ts_millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ts_millis).unwrap_or_default()
}

/// UTC floor-to-hour bucket key, `YYYY-MM-DD-HH`.
pub fn hour_key(ts_millis: i64) -> String {
    utc(ts_millis).format("%Y-%m-%d-%H").to_string()
}

/// UTC day key, `YYYY-MM-DD`.
pub fn day_key(ts_millis: i64) -> String {
    utc(ts_millis).format("%Y-%m-%d").to_string()
}

/// Hour keys for the last `hours` hours ending at `now_millis`, newest first.
pub fn recent_hour_keys(now_millis: i64, hours: u32) -> Vec<String> {
    (0..hours as i64)
        .map(|h| hour_key(now_millis - h * 3_600_000))
        .collect()
}
